//! ファインチューニング用のコールバック
//!
//! どちらも検証損失を監視します。エポックごとに `step` を呼び出してください。

use tracing::info;

use crate::model::CallbackSettings;

/// 早期終了
///
/// `patience` エポック連続で検証損失が `min_delta` を超えて改善しなければ停止。
/// 最良エポックを記録し、最良モデルの保持・復元は学習ループ側で行います。
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    best_epoch: Option<usize>,
    wait: usize,
}

/// `EarlyStopping::step` の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// 最良値を更新した
    Improved,
    /// 改善なし、継続
    Continue,
    /// 学習を停止
    Stop,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: None,
            best_epoch: None,
            wait: 0,
        }
    }

    pub fn from_settings(settings: &CallbackSettings) -> Self {
        Self::new(settings.early_stopping_patience, 0.0)
    }

    pub fn step(&mut self, epoch: usize, val_loss: f64) -> StopDecision {
        let improved = match self.best {
            Some(best) => val_loss < best - self.min_delta,
            None => true,
        };

        if improved {
            self.best = Some(val_loss);
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StopDecision::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            info!(
                "[EarlyStopping] {} エポック改善なし。最良エポック: {:?}",
                self.wait, self.best_epoch
            );
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// 停滞時の学習率削減
///
/// `patience` エポック連続で改善がなければ学習率を `factor` 倍し（下限 `min_lr`）、
/// 待機カウンタをリセットします。
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best: Option<f64>,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta: 1e-4,
            best: None,
            wait: 0,
        }
    }

    pub fn from_settings(settings: &CallbackSettings) -> Self {
        Self::new(
            settings.lr_reduction_factor,
            settings.lr_reduction_patience,
            settings.min_learning_rate,
        )
    }

    /// 次エポックの学習率を返す
    pub fn step(&mut self, val_loss: f64, current_lr: f64) -> f64 {
        let improved = match self.best {
            Some(best) => val_loss < best - self.min_delta,
            None => true,
        };

        if improved {
            self.best = Some(val_loss);
            self.wait = 0;
            return current_lr;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return current_lr;
        }

        self.wait = 0;
        let reduced = (current_lr * self.factor).max(self.min_lr);
        if reduced < current_lr {
            info!("[ReduceLROnPlateau] 学習率を削減: {:.2e} -> {:.2e}", current_lr, reduced);
        }
        reduced
    }
}
