//! 画像のデコードと正規化
//!
//! 学習と推論の両方がこのモジュールを通るため、前処理は常に一致します。

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::path::Path;

/// ImageNetの平均
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// RGBに変換して `size x size` にリサイズ（アスペクト比は保持しない）
fn to_model_input(img: DynamicImage, size: usize) -> RgbImage {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width as usize == size && height as usize == size {
        return rgb;
    }
    image::imageops::resize(&rgb, size as u32, size as u32, FilterType::Triangle)
}

/// ImageNetの平均と標準偏差で正規化し、(C, H, W) の順で平坦化
pub fn normalize_rgb(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let value = img.get_pixel(x, y)[channel] as f32 / 255.0;
                data.push((value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]);
            }
        }
    }

    data
}

/// 画像ファイルを読み込んで正規化
pub fn load_and_normalize_image(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;
    Ok(normalize_rgb(&to_model_input(img, size)))
}

/// メモリ上のエンコード済み画像（JPEG, PNG など）を正規化
pub fn decode_and_normalize(bytes: &[u8], size: usize) -> Result<Vec<f32>> {
    let img = image::load_from_memory(bytes).context("Invalid image")?;
    Ok(normalize_rgb(&to_model_input(img, size)))
}
