//! モデル推論機能

use anyhow::{anyhow, bail, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::data::preprocess::{decode_and_normalize, load_and_normalize_image};
use crate::ml::ml_model::{LesionClassifier, ModelConfig};
use crate::model::{load_model_with_metadata, InferenceConfig};

/// 1枚分の推論結果
///
/// JSONでは `{"label": ..., "confidence": ..., "probs": {...}}` になります。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    pub probs: BTreeMap<String, f32>,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: LesionClassifier<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let config = InferenceConfig::from_metadata(&metadata);

        let model = ModelConfig::new(config.num_classes())
            .with_dropout(metadata.dropout)
            .init::<B>(&device);

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, model_binary, &device)
            .map_err(|e| anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        info!(
            "[Inference] モデルを読み込みました: {} ({} クラス, 入力 {}x{})",
            model_path.as_ref().display(),
            config.num_classes(),
            config.image_size,
            config.image_size
        );

        Ok(Self {
            model,
            config,
            device,
        })
    }

    /// エンコード済み画像（JPEG, PNG など）を分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let image_data = decode_and_normalize(bytes, self.config.image_size)?;
        self.predict_normalized(image_data, 1)?
            .pop()
            .ok_or_else(|| anyhow!("推論結果が空です"))
    }

    /// 画像ファイルを分類
    pub fn predict_path<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let image_data = load_and_normalize_image(image_path.as_ref(), self.config.image_size)?;
        self.predict_normalized(image_data, 1)?
            .pop()
            .ok_or_else(|| anyhow!("推論結果が空です"))
    }

    /// 複数画像をまとめて1回の順伝播で分類
    pub fn predict_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        if image_paths.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_pixels = Vec::new();
        for path in image_paths {
            all_pixels.extend(load_and_normalize_image(path.as_ref(), self.config.image_size)?);
        }
        self.predict_normalized(all_pixels, image_paths.len())
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    fn predict_normalized(&self, pixels: Vec<f32>, batch_size: usize) -> Result<Vec<Prediction>> {
        let size = self.config.image_size;
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);

        let probs = self
            .model
            .probabilities(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("推論結果の取得エラー: {:?}", e))?;

        probs
            .chunks(self.config.num_classes())
            .map(|row| to_prediction(&self.config, row))
            .collect()
    }
}

/// 1行分の確率から推論結果を作成
///
/// NaN などの非有限値が含まれる場合はエラー。
fn to_prediction(config: &InferenceConfig, row: &[f32]) -> Result<Prediction> {
    if let Some(p) = row.iter().find(|p| !p.is_finite()) {
        bail!("推論結果に非有限の確率が含まれています: {}", p);
    }

    let (class_idx, confidence) = row
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .ok_or_else(|| anyhow!("推論結果が空です"))?;

    let label = config
        .class_index_to_label(class_idx)
        .ok_or_else(|| anyhow!("クラスインデックス {} は範囲外です", class_idx))?
        .to_string();

    let probs = config
        .class_labels
        .iter()
        .cloned()
        .zip(row.iter().copied())
        .collect();

    Ok(Prediction {
        label,
        confidence,
        probs,
    })
}
