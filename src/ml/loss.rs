//! Focal loss
//!
//! クラス不均衡（nv が大半を占める）に対処するため、正解確率が高いサンプルの寄与を
//! `(1 - p)^gamma` で減衰させます。学習専用で、モデルと一緒には保存されません。

use burn::{
    config::Config,
    tensor::{activation::softmax, backend::Backend, Tensor},
};

/// 確率のクリップ幅
const EPSILON: f32 = 1e-7;

/// Focal loss の設定
#[derive(Config, Debug)]
pub struct FocalLossConfig {
    /// 減衰の強さ
    #[config(default = 2.0)]
    pub gamma: f64,
    /// 重み係数
    #[config(default = 0.25)]
    pub alpha: f64,
}

impl FocalLossConfig {
    pub fn init(&self) -> FocalLoss {
        FocalLoss {
            gamma: self.gamma,
            alpha: self.alpha,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FocalLoss {
    gamma: f64,
    alpha: f64,
}

impl FocalLoss {
    /// バッチ平均の損失を計算
    ///
    /// # 引数
    /// - `logits`: [batch_size, num_classes]
    /// - `targets`: one-hot [batch_size, num_classes]
    ///
    /// # 戻り値
    /// - 形状 [1] のスカラーテンソル
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
        let probs = softmax(logits, 1).clamp(EPSILON, 1.0 - EPSILON);

        let cross_entropy = targets.neg() * probs.clone().log();
        let weight = probs
            .neg()
            .add_scalar(1.0)
            .powf_scalar(self.gamma)
            .mul_scalar(self.alpha);

        // クラス方向に合計してからバッチ平均
        (weight * cross_entropy).sum_dim(1).mean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{activation::log_softmax, ElementConversion};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f32 {
        tensor.into_scalar().elem::<f32>()
    }

    fn sample_batch() -> (Tensor<TestBackend, 2>, Tensor<TestBackend, 2>) {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<TestBackend, 1>::from_floats([1.0, 0.5, -1.0, 0.2, 2.0, 0.0], &device)
            .reshape([2, 3]);
        let targets = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, 0.0, 0.0, 0.0, 1.0], &device)
            .reshape([2, 3]);
        (logits, targets)
    }

    #[test]
    fn test_defaults() {
        let config = FocalLossConfig::new();
        assert_eq!(config.gamma, 2.0);
        assert_eq!(config.alpha, 0.25);
    }

    #[test]
    fn test_confident_correct_prediction_is_near_zero() {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<TestBackend, 1>::from_floats([30.0, -30.0], &device).reshape([1, 2]);
        let targets = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0], &device).reshape([1, 2]);

        let loss = scalar(FocalLossConfig::new().init().forward(logits, targets));
        assert!(loss >= 0.0);
        assert!(loss < 1e-6, "loss = {}", loss);
    }

    #[test]
    fn test_gamma_zero_is_scaled_cross_entropy() {
        let (logits, targets) = sample_batch();

        let focal = FocalLossConfig::new()
            .with_gamma(0.0)
            .with_alpha(1.0)
            .init()
            .forward(logits.clone(), targets.clone());

        let expected = (targets.neg() * log_softmax(logits, 1)).sum_dim(1).mean();
        assert!((scalar(focal) - scalar(expected)).abs() < 1e-5);
    }

    #[test]
    fn test_alpha_scales_linearly() {
        let (logits, targets) = sample_batch();

        let full = FocalLossConfig::new()
            .with_alpha(1.0)
            .init()
            .forward(logits.clone(), targets.clone());
        let quarter = FocalLossConfig::new().init().forward(logits, targets);

        assert!((scalar(full) * 0.25 - scalar(quarter)).abs() < 1e-6);
    }

    #[test]
    fn test_focusing_reduces_loss() {
        let (logits, targets) = sample_batch();

        let plain = FocalLossConfig::new()
            .with_gamma(0.0)
            .init()
            .forward(logits.clone(), targets.clone());
        let focused = FocalLossConfig::new().init().forward(logits, targets);

        assert!(scalar(focused) < scalar(plain));
    }
}
