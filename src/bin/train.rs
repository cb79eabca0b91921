//! 皮膚病変分類モデルの学習
//!
//! ```text
//! cargo run --release --bin train -- --config config.json
//! cargo run --release --bin train -- --device cpu --output models/test.tar.gz
//! ```

#![recursion_limit = "256"]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use skin_lesion_classifier::logging;
use skin_lesion_classifier::ml::backend::{cpu_device, CpuTrainingBackend};
use skin_lesion_classifier::ml::{train_model, TrainingReport};
use skin_lesion_classifier::model::{print_metadata_info, AppConfig, DeviceType};

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train the skin lesion classifier (warmup + fine-tune)")]
struct Args {
    /// 設定ファイル（指定時は読み込み失敗でエラー、未指定なら config.json かデフォルト設定）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 計算デバイス（設定ファイルより優先）
    #[arg(short, long, value_enum)]
    device: Option<DeviceType>,

    /// 出力先（設定ファイルより優先）
    #[arg(short, long)]
    output: Option<String>,

    /// デフォルト設定を --config に書き出して終了
    #[arg(long)]
    init_config: bool,
}

#[cfg(feature = "wgpu")]
fn train_on_gpu(config: &AppConfig) -> Result<TrainingReport> {
    use skin_lesion_classifier::ml::backend::{gpu_device, GpuTrainingBackend};
    train_model::<GpuTrainingBackend>(config, gpu_device())
}

#[cfg(not(feature = "wgpu"))]
fn train_on_gpu(_config: &AppConfig) -> Result<TrainingReport> {
    anyhow::bail!("this binary was built without the `wgpu` feature; use --device cpu")
}

fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    if args.init_config {
        let path = args.config.unwrap_or_else(AppConfig::default_path);
        AppConfig::default()
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("デフォルト設定を書き出しました: {}", path.display());
        return Ok(());
    }

    let mut config = AppConfig::load_explicit_or_default(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.device_type = device;
    }
    if let Some(output) = args.output {
        config.model.output_path = output;
    }
    config.display();

    let report = match config.device_type {
        DeviceType::Cpu => train_model::<CpuTrainingBackend>(&config, cpu_device())?,
        DeviceType::Wgpu => train_on_gpu(&config)?,
    };

    print_metadata_info(&report.metadata);
    println!("保存先: {}", report.model_path.display());
    Ok(())
}
