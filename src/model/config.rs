//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、学習データの場所、学習スケジュールなどをJSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 学習データの場所
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// メタデータCSV（image_id, dx 列を含む）
    pub metadata_csv: String,
    /// 画像ディレクトリ
    pub image_dir: String,
    /// 画像ファイルの拡張子
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
}

fn default_image_extension() -> String {
    "jpg".to_string()
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            metadata_csv: "data/HAM10000_metadata.csv".to_string(),
            image_dir: "data/HAM10000_images".to_string(),
            image_extension: default_image_extension(),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 学習済みモデル（tar.gz）の出力先
    pub output_path: String,
    /// 分類ヘッドのドロップアウト率
    pub dropout: f64,
    /// 事前学習済みバックボーンの重み（Burnレコード, .mpk）
    #[serde(default)]
    pub pretrained_backbone: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            output_path: "models/skin_lesion_model.tar.gz".to_string(),
            dropout: 0.4,
            pretrained_backbone: None,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 画像デコード用ワーカー数
    pub num_workers: usize,
    /// ウォームアップ（バックボーン凍結）のエポック数
    pub warmup_epochs: usize,
    /// ファインチューニングの最大エポック数
    pub fine_tune_epochs: usize,
    /// ウォームアップの学習率
    pub warmup_learning_rate: f64,
    /// ファインチューニングの学習率
    pub fine_tune_learning_rate: f64,
    /// ファインチューニングで学習させるバックボーン末尾のユニット数
    pub fine_tune_units: usize,
    /// 検証データの割合
    pub validation_ratio: f64,
    /// ランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            image_size: 192,
            batch_size: 16,
            num_workers: 4,
            warmup_epochs: 2,
            fine_tune_epochs: 15,
            warmup_learning_rate: 1e-3,
            fine_tune_learning_rate: 3e-5,
            fine_tune_units: 2,
            validation_ratio: 0.2,
            seed: 42,
        }
    }
}

/// Focal Loss のパラメータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossSettings {
    pub gamma: f64,
    pub alpha: f64,
}

impl Default for LossSettings {
    fn default() -> Self {
        Self {
            gamma: 2.0,
            alpha: 0.25,
        }
    }
}

/// 早期終了・学習率減衰の設定（ファインチューニング時のみ使用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSettings {
    /// 検証損失が改善しないまま許容するエポック数
    pub early_stopping_patience: usize,
    /// 学習率を下げる際の係数
    pub lr_reduction_factor: f64,
    /// 学習率を下げるまでに待つエポック数
    pub lr_reduction_patience: usize,
    /// 学習率の下限
    pub min_learning_rate: f64,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            early_stopping_patience: 4,
            lr_reduction_factor: 0.3,
            lr_reduction_patience: 2,
            min_learning_rate: 1e-6,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 学習データ設定
    #[serde(default)]
    pub data: DataSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 損失関数設定
    #[serde(default)]
    pub loss: LossSettings,
    /// コールバック設定
    #[serde(default)]
    pub callbacks: CallbackSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 指定パスから設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {:#}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 明示されたパスは必ず読み込む（失敗はエラー）。未指定ならデフォルトパスから読み込む
    pub fn load_explicit_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let config = Self::load(path)?;
                info!("設定ファイルを読み込みました: {}", path.display());
                Ok(config)
            }
            None => Ok(Self::load_or_default()),
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.training;
        if t.image_size < 32 {
            anyhow::bail!("image_size must be at least 32 (got {})", t.image_size);
        }
        if t.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if !(t.validation_ratio > 0.0 && t.validation_ratio < 1.0) {
            anyhow::bail!(
                "validation_ratio must be in (0, 1) (got {})",
                t.validation_ratio
            );
        }
        if t.warmup_learning_rate <= 0.0 || t.fine_tune_learning_rate <= 0.0 {
            anyhow::bail!("learning rates must be positive");
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            anyhow::bail!("dropout must be in [0, 1) (got {})", self.model.dropout);
        }

        let c = &self.callbacks;
        if !(c.lr_reduction_factor > 0.0 && c.lr_reduction_factor < 1.0) {
            anyhow::bail!(
                "lr_reduction_factor must be in (0, 1) (got {})",
                c.lr_reduction_factor
            );
        }
        if c.min_learning_rate > t.fine_tune_learning_rate {
            anyhow::bail!(
                "min_learning_rate ({}) exceeds fine_tune_learning_rate ({})",
                c.min_learning_rate,
                t.fine_tune_learning_rate
            );
        }
        if self.loss.gamma < 0.0 || self.loss.alpha <= 0.0 {
            anyhow::bail!("focal loss requires gamma >= 0 and alpha > 0");
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("メタデータ: {}", self.data.metadata_csv);
        println!("画像ディレクトリ: {}", self.data.image_dir);
        println!("出力先: {}", self.model.output_path);
        println!("ドロップアウト率: {}", self.model.dropout);
        if let Some(ref weights) = self.model.pretrained_backbone {
            println!("事前学習済み重み: {}", weights);
        }
        println!("\n--- トレーニング設定 ---");
        println!("入力サイズ: {}x{}", self.training.image_size, self.training.image_size);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!(
            "エポック数: ウォームアップ {} + ファインチューニング {}",
            self.training.warmup_epochs, self.training.fine_tune_epochs
        );
        println!(
            "学習率: {} -> {}",
            self.training.warmup_learning_rate, self.training.fine_tune_learning_rate
        );
        println!("検証データ割合: {}", self.training.validation_ratio);
        println!("シード: {}", self.training.seed);
        println!("\n--- 損失関数 ---");
        println!("Focal Loss: gamma={}, alpha={}", self.loss.gamma, self.loss.alpha);
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.image_size, 192);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.warmup_epochs, 2);
        assert_eq!(config.training.fine_tune_epochs, 15);
        assert_eq!(config.callbacks.early_stopping_patience, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.output_path, deserialized.model.output_path);
        assert_eq!(config.training.seed, deserialized.training.seed);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "device_type": "Cpu", "training": {
            "image_size": 64, "batch_size": 4, "num_workers": 1,
            "warmup_epochs": 1, "fine_tune_epochs": 1,
            "warmup_learning_rate": 0.001, "fine_tune_learning_rate": 0.0001,
            "fine_tune_units": 1, "validation_ratio": 0.5, "seed": 7 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.image_size, 64);
        assert_eq!(config.data.image_extension, "jpg");
        assert_eq!(config.loss.gamma, 2.0);
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let mut config = AppConfig::default();
        config.training.validation_ratio = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.callbacks.min_learning_rate = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let path = std::env::temp_dir().join("skin_lesion_missing_config_for_test.json");
        let _ = fs::remove_file(&path);
        let config = AppConfig::load_or_default_from(&path);
        assert_eq!(config.training.seed, 42);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }

    #[test]
    fn test_explicit_config_must_parse() {
        let path = std::env::temp_dir().join(format!(
            "skin_lesion_broken_config_{}.json",
            std::process::id()
        ));
        fs::write(&path, "{ \"training\": ").unwrap();

        let err = AppConfig::load_explicit_or_default(Some(path.as_path())).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_explicit_config_missing_file_is_error() {
        let path = std::env::temp_dir().join("skin_lesion_missing_explicit_config_for_test.json");
        let _ = fs::remove_file(&path);
        assert!(AppConfig::load_explicit_or_default(Some(path.as_path())).is_err());
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let path = std::env::temp_dir().join(format!(
            "skin_lesion_explicit_config_{}.json",
            std::process::id()
        ));
        let mut expected = AppConfig::default();
        expected.training.seed = 7;
        expected.save(&path).unwrap();

        let config = AppConfig::load_explicit_or_default(Some(path.as_path())).unwrap();
        assert_eq!(config.training.seed, 7);

        fs::remove_file(&path).ok();
    }
}
