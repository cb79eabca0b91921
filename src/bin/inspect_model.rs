//! モデルアーカイブのメタデータを表示

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use skin_lesion_classifier::logging;
use skin_lesion_classifier::model::{load_metadata, print_metadata_info};

#[derive(Parser)]
#[command(name = "inspect_model")]
#[command(about = "Print the metadata stored in a model archive")]
struct Args {
    /// モデルアーカイブ (.tar.gz)
    model: PathBuf,

    /// JSONのまま出力
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let metadata = load_metadata(&args.model)?;
    if args.json {
        println!("{}", metadata.to_json_string()?);
    } else {
        print_metadata_info(&metadata);
    }
    Ok(())
}
