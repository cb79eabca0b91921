//! 学習メタデータCSVの読み込み
//!
//! HAM10000形式（`lesion_id,image_id,dx,dx_type,age,sex,localization`）を想定。
//! 必須列は `image_id` と `dx` のみで、列の順序は問いません。

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const IMAGE_ID_COLUMN: &str = "image_id";
const LABEL_COLUMN: &str = "dx";

/// 1枚の病変画像とその診断ラベル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LesionRecord {
    pub image_id: String,
    pub label: String,
    pub image_path: PathBuf,
}

/// メタデータCSVを読み込み、画像パスを解決する
pub fn load_metadata_csv(
    csv_path: &Path,
    image_dir: &Path,
    image_extension: &str,
) -> Result<Vec<LesionRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open metadata CSV: {}", csv_path.display()))?;

    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow::anyhow!("Missing column '{}' in {}", name, csv_path.display()))
    };
    let image_id_idx = column(IMAGE_ID_COLUMN)?;
    let label_idx = column(LABEL_COLUMN)?;

    let mut records = Vec::new();

    for (row, result) in reader.records().enumerate() {
        let record = result?;
        // ヘッダー行を除いた1始まりの行番号
        let row = row + 1;

        let image_id = record.get(image_id_idx).unwrap_or_default();
        if image_id.is_empty() {
            anyhow::bail!("Row {}: empty '{}'", row, IMAGE_ID_COLUMN);
        }
        let label = record.get(label_idx).unwrap_or_default();
        if label.is_empty() {
            anyhow::bail!("Row {}: empty '{}'", row, LABEL_COLUMN);
        }

        records.push(LesionRecord {
            image_id: image_id.to_string(),
            label: label.to_string(),
            image_path: image_dir.join(format!("{}.{}", image_id, image_extension)),
        });
    }

    if records.is_empty() {
        anyhow::bail!("No rows found in {}", csv_path.display());
    }

    Ok(records)
}

/// 画像ファイルの存在を確認し、欠けているものがあればエラーにする
pub fn verify_images_exist(records: &[LesionRecord]) -> Result<()> {
    let missing: Vec<&LesionRecord> = records
        .iter()
        .filter(|r| !r.image_path.is_file())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    let preview: Vec<String> = missing
        .iter()
        .take(5)
        .map(|r| r.image_path.display().to_string())
        .collect();
    anyhow::bail!(
        "{} of {} images are missing, e.g.:\n{}",
        missing.len(),
        records.len(),
        preview.join("\n")
    )
}

/// ラベルごとの件数（ラベル名順）
pub fn class_counts(records: &[LesionRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.label.clone()).or_insert(0) += 1;
    }
    counts
}
