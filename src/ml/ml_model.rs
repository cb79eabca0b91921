//! 機械学習モデルの共通定義
//!
//! 皮膚病変分類用モデル（EfficientNet-B0 + 分類ヘッド）と関連する設定を提供します。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
};
use std::path::Path;
use tracing::{info, warn};

use crate::ml::efficientnet::{EfficientNetB0, FEATURE_CHANNELS};

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.4)]
    pub dropout: f64,
}

impl ModelConfig {
    /// モデルを初期化（バックボーンはランダム初期化）
    pub fn init<B: Backend>(&self, device: &B::Device) -> LesionClassifier<B> {
        LesionClassifier {
            backbone: EfficientNetB0::new(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            norm: BatchNormConfig::new(FEATURE_CHANNELS).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            classifier: LinearConfig::new(FEATURE_CHANNELS, self.num_classes).init(device),
        }
    }

    /// モデルを初期化し、指定があれば事前学習済みバックボーンを読み込む
    pub fn init_with_backbone<B: Backend>(
        &self,
        pretrained_backbone: Option<&Path>,
        device: &B::Device,
    ) -> Result<LesionClassifier<B>> {
        let mut model = self.init(device);

        match pretrained_backbone {
            Some(path) => {
                let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
                model.backbone = model
                    .backbone
                    .load_file(path, &recorder, device)
                    .with_context(|| {
                        format!("Failed to load pretrained backbone: {}", path.display())
                    })?;
                info!("[Model] 事前学習済みバックボーンを読み込みました: {}", path.display());
            }
            None => {
                warn!("[Model] 事前学習済み重みが指定されていません。バックボーンはランダム初期化です");
            }
        }

        info!(
            "[Model] クラス数: {}, dropout: {}, パラメータ数: {:.2}M",
            self.num_classes,
            self.dropout,
            model.num_params() as f64 / 1_000_000.0
        );

        Ok(model)
    }
}

/// 皮膚病変分類モデル
///
/// # アーキテクチャ
/// - EfficientNet-B0 特徴抽出器 -> [batch, 1280, h, w]
/// - Global Average Pooling
/// - BatchNorm
/// - Dropout
/// - FC: 1280 -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct LesionClassifier<B: Backend> {
    backbone: EfficientNetB0<B>,
    pool: AdaptiveAvgPool2d,
    norm: BatchNorm<B>,
    dropout: Dropout,
    classifier: Linear<B>,
}

impl<B: Backend> LesionClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_head(self.backbone.forward(images))
    }

    /// 特徴マップ -> ロジット
    fn forward_head(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();

        let x = self.pool.forward(features).reshape([batch_size, channels]);
        let x = self.norm.forward(x);
        let x = self.dropout.forward(x);
        self.classifier.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size, 1], 確率)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let probs = self.probabilities(images);
        (probs.clone().argmax(1), probs)
    }
}

impl<B: AutodiffBackend> LesionClassifier<B> {
    /// バックボーン先頭 `frozen_units` 個を凍結した順伝播（学習用）
    ///
    /// `frozen_units` がバックボーンのユニット数以上なら全体が凍結されます。
    pub fn forward_training(&self, images: Tensor<B, 4>, frozen_units: usize) -> Tensor<B, 2> {
        self.forward_head(self.backbone.forward_frozen(images, frozen_units))
    }
}
