//! 計算バックエンドの型定義
//!
//! 学習は Autodiff でラップしたバックエンド、推論は素のバックエンドを使います。

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};

/// CPU (NdArray) 推論用
pub type CpuBackend = NdArray<f32>;
/// CPU (NdArray) 学習用
pub type CpuTrainingBackend = Autodiff<CpuBackend>;

/// GPU (WGPU) 推論用
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;
/// GPU (WGPU) 学習用
#[cfg(feature = "wgpu")]
pub type GpuTrainingBackend = Autodiff<GpuBackend>;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// 利用可能な最適なGPU（見つからなければ wgpu が CPU アダプタを選択）
#[cfg(feature = "wgpu")]
pub fn gpu_device() -> burn_wgpu::WgpuDevice {
    burn_wgpu::WgpuDevice::default()
}
