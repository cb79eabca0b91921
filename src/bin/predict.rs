//! 保存済みモデルで画像を分類し、1画像1行のJSONを出力
//!
//! ```text
//! cargo run --release --bin predict -- --model models/skin_lesion_model.tar.gz lesion.jpg
//! ```

#![recursion_limit = "256"]

use anyhow::Result;
use burn::tensor::backend::Backend;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

use skin_lesion_classifier::logging;
use skin_lesion_classifier::ml::backend::{cpu_device, CpuBackend};
use skin_lesion_classifier::ml::InferenceEngine;
use skin_lesion_classifier::model::DeviceType;

#[derive(Parser)]
#[command(name = "predict")]
#[command(about = "Classify skin lesion images with a trained model")]
struct Args {
    /// モデルアーカイブ (.tar.gz)
    #[arg(short, long, default_value = "models/skin_lesion_model.tar.gz")]
    model: PathBuf,

    /// 計算デバイス
    #[arg(short, long, value_enum, default_value = "cpu")]
    device: DeviceType,

    /// 分類する画像
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn run<B: Backend>(args: &Args, device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(&args.model, device)?;

    for image in &args.images {
        let line = match std::fs::read(image)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| engine.predict_bytes(&bytes))
        {
            Ok(prediction) => json!({
                "image": image.display().to_string(),
                "label": prediction.label,
                "confidence": prediction.confidence,
                "probs": prediction.probs,
            }),
            Err(e) => json!({
                "image": image.display().to_string(),
                "error": format!("{:#}", e),
            }),
        };
        println!("{}", line);
    }

    Ok(())
}

#[cfg(feature = "wgpu")]
fn run_on_gpu(args: &Args) -> Result<()> {
    use skin_lesion_classifier::ml::backend::{gpu_device, GpuBackend};
    run::<GpuBackend>(args, gpu_device())
}

#[cfg(not(feature = "wgpu"))]
fn run_on_gpu(_args: &Args) -> Result<()> {
    anyhow::bail!("this binary was built without the `wgpu` feature; use --device cpu")
}

fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    match args.device {
        DeviceType::Cpu => run::<CpuBackend>(&args, cpu_device()),
        DeviceType::Wgpu => run_on_gpu(&args),
    }
}
