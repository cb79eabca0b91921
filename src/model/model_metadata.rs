//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。
//! 推論側はクラスラベルと入力サイズをここから復元するため、
//! 学習時と推論時で前処理やラベル順序が食い違うことはありません。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// メタデータ形式のバージョン
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// 学習フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    /// バックボーン凍結
    Warmup,
    /// バックボーン末尾を解凍
    FineTune,
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingPhase::Warmup => write!(f, "warmup"),
            TrainingPhase::FineTune => write!(f, "fine-tune"),
        }
    }
}

/// 1エポック分の学習記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub phase: TrainingPhase,
    /// フェーズ内のエポック番号（1始まり）
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// メタデータ形式のバージョン
    #[serde(default = "default_format_version")]
    pub format_version: u32,

    /// クラスラベル（クラスインデックス順 = 学習データのソート済み語彙）
    /// 例: ["akiec", "bcc", "bkl", "df", "mel", "nv", "vasc"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形）
    pub image_size: u32,

    /// 分類ヘッドのドロップアウト率
    pub dropout: f64,

    /// ウォームアップのエポック数
    pub warmup_epochs: u32,

    /// 実際に実行したファインチューニングのエポック数（早期終了を反映）
    pub fine_tune_epochs_run: u32,

    /// 復元したベストモデルのエポック（ファインチューニング内、1始まり）
    #[serde(default)]
    pub best_epoch: Option<u32>,

    /// ベストモデルの検証損失
    #[serde(default)]
    pub best_val_loss: Option<f64>,

    /// ベストモデルの検証精度
    #[serde(default)]
    pub best_val_accuracy: Option<f64>,

    /// 学習データ・検証データの枚数
    pub train_samples: usize,
    pub val_samples: usize,

    /// エポックごとの履歴
    #[serde(default)]
    pub history: Vec<EpochRecord>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

fn default_format_version() -> u32 {
    METADATA_FORMAT_VERSION
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(class_labels: Vec<String>, image_size: u32, dropout: f64) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            format_version: METADATA_FORMAT_VERSION,
            class_labels,
            image_size,
            dropout,
            warmup_epochs: 0,
            fine_tune_epochs_run: 0,
            best_epoch: None,
            best_val_loss: None,
            best_val_accuracy: None,
            train_samples: 0,
            val_samples: 0,
            history: Vec::new(),
            trained_at,
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.format_version > METADATA_FORMAT_VERSION {
            anyhow::bail!(
                "Unsupported metadata format version {} (supported: <= {})",
                metadata.format_version,
                METADATA_FORMAT_VERSION
            );
        }
        if metadata.class_labels.is_empty() {
            anyhow::bail!("Metadata contains no class labels");
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        ["akiec", "bcc", "bkl", "df", "mel", "nv", "vasc"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_json_preserves_history() {
        let mut metadata = ModelMetadata::new(labels(), 192, 0.4);
        metadata.history.push(EpochRecord {
            phase: TrainingPhase::Warmup,
            epoch: 1,
            learning_rate: 1e-3,
            train_loss: 0.5,
            train_accuracy: 0.6,
            val_loss: 0.45,
            val_accuracy: 0.65,
        });

        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"warmup\""));

        let restored = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(restored.num_classes(), 7);
        assert_eq!(restored.history, metadata.history);
    }

    #[test]
    fn test_rejects_future_version() {
        let mut metadata = ModelMetadata::new(labels(), 192, 0.4);
        metadata.format_version = METADATA_FORMAT_VERSION + 1;
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(ModelMetadata::from_json_string(&json).is_err());
    }

    #[test]
    fn test_rejects_empty_labels() {
        let metadata = ModelMetadata::new(Vec::new(), 192, 0.4);
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(ModelMetadata::from_json_string(&json).is_err());
    }
}
