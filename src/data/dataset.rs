//! 学習用データセットとバッチャー
//!
//! データセットはパスとラベルのみ保持し、画像のデコードはバッチ作成時に行います。

use anyhow::Result;
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use std::path::PathBuf;
use tracing::warn;

use crate::data::metadata::LesionRecord;
use crate::data::preprocess::load_and_normalize_image;
use crate::data::vocabulary::LabelVocabulary;

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct LesionItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 学習/検証データセット
pub struct LesionDataset {
    items: Vec<LesionItem>,
}

impl LesionDataset {
    /// レコードのラベルを語彙でクラスIDに変換して作成
    pub fn new(records: &[LesionRecord], vocabulary: &LabelVocabulary) -> Result<Self> {
        let items = records
            .iter()
            .map(|record| {
                Ok(LesionItem {
                    path: record.image_path.clone(),
                    label: vocabulary.index_of(&record.label)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { items })
    }
}

impl Dataset<LesionItem> for LesionDataset {
    fn get(&self, index: usize) -> Option<LesionItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct LesionBatch<B: Backend> {
    /// [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// one-hot ターゲット [batch_size, num_classes]
    pub targets: Tensor<B, 2>,
    /// クラスID [batch_size]
    pub labels: Tensor<B, 1, Int>,
}

/// バッチャー
#[derive(Clone)]
pub struct LesionBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    num_classes: usize,
}

impl<B: Backend> LesionBatcher<B> {
    pub fn new(device: B::Device, image_size: usize, num_classes: usize) -> Self {
        Self {
            device,
            image_size,
            num_classes,
        }
    }
}

impl<B: Backend> Batcher<B, LesionItem, LesionBatch<B>> for LesionBatcher<B> {
    fn batch(&self, items: Vec<LesionItem>, _device: &B::Device) -> LesionBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let pixels_per_image = 3 * size * size;

        let mut all_pixels = Vec::with_capacity(batch_size * pixels_per_image);
        let mut one_hot = vec![0.0f32; batch_size * self.num_classes];
        let mut labels = Vec::with_capacity(batch_size);

        for (row, item) in items.iter().enumerate() {
            match load_and_normalize_image(&item.path, size) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    // 1枚の破損でエポック全体を止めない
                    warn!("画像読み込み失敗 {}: {:#}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(pixels_per_image));
                }
            }
            one_hot[row * self.num_classes + item.label] = 1.0;
            labels.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1>::from_floats(one_hot.as_slice(), &self.device)
            .reshape([batch_size, self.num_classes]);
        let labels = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), &self.device);

        LesionBatch {
            images,
            targets,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::ElementConversion;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_dataset_maps_labels() {
        let vocab = LabelVocabulary::from_labels(["mel", "nv"]).unwrap();
        let records = vec![
            LesionRecord {
                image_id: "a".into(),
                label: "nv".into(),
                image_path: PathBuf::from("a.jpg"),
            },
            LesionRecord {
                image_id: "b".into(),
                label: "mel".into(),
                image_path: PathBuf::from("b.jpg"),
            },
        ];

        let dataset = LesionDataset::new(&records, &vocab).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(0).unwrap().label, 1);
        assert_eq!(dataset.get(1).unwrap().label, 0);
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn test_dataset_rejects_unknown_label() {
        let vocab = LabelVocabulary::from_labels(["mel"]).unwrap();
        let records = vec![LesionRecord {
            image_id: "a".into(),
            label: "df".into(),
            image_path: PathBuf::from("a.jpg"),
        }];
        assert!(LesionDataset::new(&records, &vocab).is_err());
    }

    #[test]
    fn test_batch_shapes_and_unreadable_image() {
        let dir = std::env::temp_dir().join(format!("skin_lesion_batch_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let good = dir.join("good.png");
        RgbImage::from_pixel(10, 12, Rgb([200, 10, 10])).save(&good).unwrap();

        let device = NdArrayDevice::Cpu;
        let batcher = LesionBatcher::<TestBackend>::new(device.clone(), 8, 3);
        let batch = batcher.batch(
            vec![
                LesionItem { path: good, label: 2 },
                LesionItem { path: dir.join("missing.png"), label: 0 },
            ],
            &device,
        );

        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), [2, 3]);

        let targets = batch.targets.into_data().to_vec::<f32>().unwrap();
        assert_eq!(targets, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);

        // 読めない画像はゼロ埋め
        let second = batch
            .images
            .slice([1..2, 0..3, 0..8, 0..8])
            .abs()
            .sum()
            .into_scalar()
            .elem::<f32>();
        assert_eq!(second, 0.0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
