//! 2段階スケジュールによるモデル学習
//!
//! 1. ウォームアップ: バックボーン全体を凍結し、分類ヘッドのみ学習
//! 2. ファインチューニング: バックボーン末尾のユニットを解凍し、低い学習率で学習
//!    （早期終了 + 学習率削減、最良エポックの重みを復元）

use anyhow::{anyhow, bail, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::data::{
    class_counts, load_metadata_csv, stratified_split, verify_images_exist, LabelVocabulary,
    LesionBatch, LesionBatcher, LesionDataset,
};
use crate::ml::callbacks::{EarlyStopping, ReduceLrOnPlateau, StopDecision};
use crate::ml::efficientnet::NUM_UNITS;
use crate::ml::loss::{FocalLoss, FocalLossConfig};
use crate::ml::ml_model::{LesionClassifier, ModelConfig};
use crate::model::{
    save_model_with_metadata, AppConfig, CallbackSettings, EpochRecord, ModelMetadata,
    TrainingPhase, TrainingSettings,
};

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// 保存したアーカイブのパス
    pub model_path: PathBuf,
    pub metadata: ModelMetadata,
}

/// フェーズごとの設定
struct PhasePlan {
    phase: TrainingPhase,
    epochs: usize,
    learning_rate: f64,
    frozen_units: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct EpochMetrics {
    loss: f64,
    accuracy: f64,
}

#[derive(Debug, Clone, Copy)]
struct BestEpoch {
    epoch: usize,
    val_loss: f64,
    val_accuracy: f64,
}

struct PhaseOutcome<M> {
    model: M,
    epochs_run: usize,
    best: Option<BestEpoch>,
}

/// バッチごとの損失と正解数を集計
#[derive(Default)]
struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl MetricAccumulator {
    fn update<B: Backend>(&mut self, loss: f64, logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) {
        let [batch_size] = labels.dims();
        let correct = logits
            .argmax(1)
            .reshape([batch_size])
            .equal(labels)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        self.loss_sum += loss * batch_size as f64;
        self.correct += correct as usize;
        self.samples += batch_size;
    }

    fn finish(&self) -> EpochMetrics {
        if self.samples == 0 {
            return EpochMetrics::default();
        }
        EpochMetrics {
            loss: self.loss_sum / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
        }
    }
}

/// 学習用と検証用のデータローダー
struct Loaders<B: AutodiffBackend> {
    train: Arc<dyn DataLoader<B, LesionBatch<B>>>,
    valid: Arc<dyn DataLoader<B::InnerBackend, LesionBatch<B::InnerBackend>>>,
}

impl<B: AutodiffBackend> Loaders<B> {
    fn new(
        train: LesionDataset,
        valid: LesionDataset,
        settings: &TrainingSettings,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        let batcher_train =
            LesionBatcher::<B>::new(device.clone(), settings.image_size, num_classes);
        let batcher_valid =
            LesionBatcher::<B::InnerBackend>::new(device.clone(), settings.image_size, num_classes);

        // 学習側のみエポックごとにシャッフル
        let train = DataLoaderBuilder::new(batcher_train)
            .batch_size(settings.batch_size)
            .shuffle(settings.seed)
            .num_workers(settings.num_workers)
            .set_device(device.clone())
            .build(train);

        let valid = DataLoaderBuilder::new(batcher_valid)
            .batch_size(settings.batch_size)
            .num_workers(settings.num_workers)
            .set_device(device.clone())
            .build(valid);

        Self { train, valid }
    }
}

/// 1エポック分の学習
fn train_epoch<B, O>(
    mut model: LesionClassifier<B>,
    optim: &mut O,
    loader: &Arc<dyn DataLoader<B, LesionBatch<B>>>,
    loss_fn: &FocalLoss,
    frozen_units: usize,
    learning_rate: f64,
) -> (LesionClassifier<B>, EpochMetrics)
where
    B: AutodiffBackend,
    O: Optimizer<LesionClassifier<B>, B>,
{
    let mut metrics = MetricAccumulator::default();

    for batch in loader.iter() {
        let logits = model.forward_training(batch.images, frozen_units);
        let loss = loss_fn.forward(logits.clone(), batch.targets);

        // 凍結部分のパラメータには勾配が存在しないため更新されない
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        metrics.update(loss.into_scalar().elem::<f64>(), logits.detach(), batch.labels);

        model = optim.step(learning_rate, model, grads);
    }

    (model, metrics.finish())
}

/// 検証（dropout 無効、BatchNorm は移動統計を使用）
fn valid_epoch<B: Backend>(
    model: &LesionClassifier<B>,
    loader: &Arc<dyn DataLoader<B, LesionBatch<B>>>,
    loss_fn: &FocalLoss,
) -> EpochMetrics {
    let mut metrics = MetricAccumulator::default();

    for batch in loader.iter() {
        let logits = model.forward(batch.images);
        let loss = loss_fn
            .forward(logits.clone(), batch.targets)
            .into_scalar()
            .elem::<f64>();
        metrics.update(loss, logits, batch.labels);
    }

    metrics.finish()
}

/// 1フェーズ分の学習
fn run_phase<B: AutodiffBackend>(
    model: LesionClassifier<B>,
    plan: &PhasePlan,
    loaders: &Loaders<B>,
    loss_fn: &FocalLoss,
    callbacks: Option<&CallbackSettings>,
    history: &mut Vec<EpochRecord>,
) -> PhaseOutcome<LesionClassifier<B>> {
    // フェーズごとに新しいオプティマイザ
    let mut optim = AdamConfig::new().init::<B, LesionClassifier<B>>();

    run_epochs(model, plan, callbacks, history, |model, learning_rate| {
        let (model, train) = train_epoch(
            model,
            &mut optim,
            &loaders.train,
            loss_fn,
            plan.frozen_units,
            learning_rate,
        );
        let valid = valid_epoch(&model.valid(), &loaders.valid, loss_fn);
        (model, train, valid)
    })
}

/// エポックループ本体
///
/// `run_epoch` は (モデル, 学習率) を受け取り、1エポック学習後の
/// (モデル, 学習指標, 検証指標) を返します。
/// `callbacks` が指定された場合は早期終了と学習率削減を行い、
/// 終了時に最良エポックのモデルを返します。
fn run_epochs<M, F>(
    mut model: M,
    plan: &PhasePlan,
    callbacks: Option<&CallbackSettings>,
    history: &mut Vec<EpochRecord>,
    mut run_epoch: F,
) -> PhaseOutcome<M>
where
    M: Clone,
    F: FnMut(M, f64) -> (M, EpochMetrics, EpochMetrics),
{
    let mut learning_rate = plan.learning_rate;
    let mut early_stopping = callbacks.map(EarlyStopping::from_settings);
    let mut lr_schedule = callbacks.map(ReduceLrOnPlateau::from_settings);
    let mut best: Option<(BestEpoch, M)> = None;
    let mut epochs_run = 0;

    info!(
        "[Training] フェーズ開始: {} (エポック数: {}, 学習率: {:.1e}, 凍結ユニット: {}/{})",
        plan.phase, plan.epochs, plan.learning_rate, plan.frozen_units, NUM_UNITS
    );

    for epoch in 1..=plan.epochs {
        let (trained, train, valid) = run_epoch(model, learning_rate);
        model = trained;
        epochs_run = epoch;

        info!(
            "[{}] エポック {}/{} - loss: {:.4}, acc: {:.4}, val_loss: {:.4}, val_acc: {:.4}, lr: {:.2e}",
            plan.phase,
            epoch,
            plan.epochs,
            train.loss,
            train.accuracy,
            valid.loss,
            valid.accuracy,
            learning_rate
        );

        history.push(EpochRecord {
            phase: plan.phase,
            epoch,
            learning_rate,
            train_loss: train.loss,
            train_accuracy: train.accuracy,
            val_loss: valid.loss,
            val_accuracy: valid.accuracy,
        });

        if let Some(stopping) = early_stopping.as_mut() {
            match stopping.step(epoch, valid.loss) {
                StopDecision::Improved => {
                    let record = BestEpoch {
                        epoch,
                        val_loss: valid.loss,
                        val_accuracy: valid.accuracy,
                    };
                    best = Some((record, model.clone()));
                }
                StopDecision::Continue => {}
                StopDecision::Stop => {
                    info!("[{}] 早期終了 (エポック {})", plan.phase, epoch);
                    break;
                }
            }
        }

        if let Some(schedule) = lr_schedule.as_mut() {
            learning_rate = schedule.step(valid.loss, learning_rate);
        }
    }

    match best {
        // 早期終了が発動しなくても最良エポックを復元する（Keras の restore_best_weights とは異なる）
        Some((record, best_model)) => {
            info!(
                "[{}] 最良エポック {} の重みを復元 (val_loss: {:.4})",
                plan.phase, record.epoch, record.val_loss
            );
            PhaseOutcome {
                model: best_model,
                epochs_run,
                best: Some(record),
            }
        }
        None => PhaseOutcome {
            model,
            epochs_run,
            best: None,
        },
    }
}

/// 設定に従ってモデルを学習し、アーカイブとして保存
pub fn train_model<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<TrainingReport> {
    config.validate()?;
    let settings = &config.training;
    if settings.fine_tune_units > NUM_UNITS {
        bail!(
            "fine_tune_units ({}) exceeds the number of backbone units ({})",
            settings.fine_tune_units,
            NUM_UNITS
        );
    }

    info!("[Training] 使用デバイス: {:?}", device);

    // === データ準備 ===
    let records = load_metadata_csv(
        Path::new(&config.data.metadata_csv),
        Path::new(&config.data.image_dir),
        &config.data.image_extension,
    )?;
    verify_images_exist(&records)?;

    info!("[Training] 読み込み: {} 件", records.len());
    for (label, count) in class_counts(&records) {
        info!("  {}: {} 枚", label, count);
    }

    let (train_records, val_records) =
        stratified_split(records, settings.validation_ratio, settings.seed)?;
    info!(
        "[Training] 学習データ: {} 枚, 検証データ: {} 枚",
        train_records.len(),
        val_records.len()
    );

    let vocabulary = LabelVocabulary::from_labels(train_records.iter().map(|r| r.label.as_str()))?;
    info!(
        "[Training] クラス ({}個): {}",
        vocabulary.len(),
        vocabulary.labels().join(", ")
    );

    let loaders = Loaders::<B>::new(
        LesionDataset::new(&train_records, &vocabulary)?,
        LesionDataset::new(&val_records, &vocabulary)?,
        settings,
        vocabulary.len(),
        &device,
    );

    // === モデル ===
    let model = ModelConfig::new(vocabulary.len())
        .with_dropout(config.model.dropout)
        .init_with_backbone::<B>(
            config.model.pretrained_backbone.as_deref().map(Path::new),
            &device,
        )?;
    let loss_fn = FocalLossConfig::new()
        .with_gamma(config.loss.gamma)
        .with_alpha(config.loss.alpha)
        .init();

    let mut history = Vec::new();

    // === ウォームアップ ===
    let warmup = PhasePlan {
        phase: TrainingPhase::Warmup,
        epochs: settings.warmup_epochs,
        learning_rate: settings.warmup_learning_rate,
        frozen_units: NUM_UNITS,
    };
    let warmup_outcome = run_phase(model, &warmup, &loaders, &loss_fn, None, &mut history);

    // === ファインチューニング ===
    let fine_tune = PhasePlan {
        phase: TrainingPhase::FineTune,
        epochs: settings.fine_tune_epochs,
        learning_rate: settings.fine_tune_learning_rate,
        frozen_units: NUM_UNITS - settings.fine_tune_units,
    };
    let outcome = run_phase(
        warmup_outcome.model,
        &fine_tune,
        &loaders,
        &loss_fn,
        Some(&config.callbacks),
        &mut history,
    );

    // === 保存 ===
    let mut metadata = ModelMetadata::new(
        vocabulary.labels().to_vec(),
        settings.image_size as u32,
        config.model.dropout,
    );
    metadata.warmup_epochs = warmup_outcome.epochs_run as u32;
    metadata.fine_tune_epochs_run = outcome.epochs_run as u32;
    metadata.train_samples = train_records.len();
    metadata.val_samples = val_records.len();

    match outcome.best {
        Some(best) => {
            metadata.best_epoch = Some(best.epoch as u32);
            metadata.best_val_loss = Some(best.val_loss);
            metadata.best_val_accuracy = Some(best.val_accuracy);
        }
        None => {
            // ファインチューニングなしの場合は最終エポックの値
            if let Some(last) = history.last() {
                metadata.best_val_loss = Some(last.val_loss);
                metadata.best_val_accuracy = Some(last.val_accuracy);
            }
        }
    }
    metadata.history = history;

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary =
        Recorder::<B::InnerBackend>::record(&recorder, outcome.model.valid().into_record(), ())
            .map_err(|e| anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;

    info!(
        "[Training] モデルバイナリサイズ: {:.2} MB",
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    let model_path =
        save_model_with_metadata(Path::new(&config.model.output_path), &metadata, &model_binary)?;
    info!("[Training] 学習完了: {} に保存しました", model_path.display());

    Ok(TrainingReport {
        model_path,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::inference::InferenceEngine;
    use crate::model::DeviceType;
    use burn::backend::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{Rgb, RgbImage};
    use std::io::Write;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    /// 2クラス x 4枚の小さなデータセットを作成
    fn write_dataset(dir: &Path) -> AppConfig {
        let image_dir = dir.join("images");
        std::fs::create_dir_all(&image_dir).unwrap();

        let csv_path = dir.join("metadata.csv");
        let mut csv = std::fs::File::create(&csv_path).unwrap();
        writeln!(csv, "lesion_id,image_id,dx,dx_type,age,sex,localization").unwrap();

        for (label, color) in [("mel", [40u8, 20, 20]), ("nv", [220u8, 180, 160])] {
            for i in 0..4 {
                let image_id = format!("{}_{}", label, i);
                RgbImage::from_pixel(36, 36, Rgb(color))
                    .save(image_dir.join(format!("{}.png", image_id)))
                    .unwrap();
                writeln!(csv, "L{},{},{},histo,50.0,male,back", i, image_id, label).unwrap();
            }
        }

        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.data.metadata_csv = csv_path.to_string_lossy().to_string();
        config.data.image_dir = image_dir.to_string_lossy().to_string();
        config.data.image_extension = "png".to_string();
        config.model.output_path = dir.join("out").join("model").to_string_lossy().to_string();
        config.training.image_size = 32;
        config.training.batch_size = 2;
        config.training.num_workers = 0;
        config.training.validation_ratio = 0.25;
        config.training.warmup_epochs = 1;
        config.training.fine_tune_epochs = 1;
        config
    }

    #[test]
    fn test_metric_accumulator() {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<TestBackend, 1>::from_floats([2.0, 0.0, 0.0, 1.0, 3.0, 0.0], &device)
            .reshape([3, 2]);
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 1], &device);

        let mut metrics = MetricAccumulator::default();
        metrics.update(0.5, logits, labels);
        let result = metrics.finish();
        assert!((result.accuracy - 2.0 / 3.0).abs() < 1e-9);
        assert!((result.loss - 0.5).abs() < 1e-9);

        assert_eq!(MetricAccumulator::default().finish().accuracy, 0.0);
    }

    #[test]
    fn test_rejects_too_many_fine_tune_units() {
        let mut config = AppConfig::default();
        config.training.fine_tune_units = NUM_UNITS + 1;
        let result = train_model::<TestAutodiffBackend>(&config, NdArrayDevice::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn test_train_and_reload() {
        let dir = std::env::temp_dir().join(format!("skin_lesion_train_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = write_dataset(&dir);

        let report = train_model::<TestAutodiffBackend>(&config, NdArrayDevice::Cpu).unwrap();
        assert!(report.model_path.exists());
        assert!(report.model_path.to_string_lossy().ends_with(".tar.gz"));

        let metadata = &report.metadata;
        assert_eq!(metadata.class_labels, vec!["mel", "nv"]);
        assert_eq!(metadata.image_size, 32);
        assert_eq!(metadata.train_samples, 6);
        assert_eq!(metadata.val_samples, 2);
        assert_eq!(metadata.warmup_epochs, 1);
        assert_eq!(metadata.fine_tune_epochs_run, 1);
        assert_eq!(metadata.history.len(), 2);
        assert_eq!(metadata.history[0].phase, TrainingPhase::Warmup);
        assert_eq!(metadata.history[1].phase, TrainingPhase::FineTune);
        assert_eq!(metadata.best_epoch, Some(1));
        assert!(metadata.best_val_loss.unwrap().is_finite());

        let engine =
            InferenceEngine::<TestBackend>::load(&report.model_path, NdArrayDevice::Cpu).unwrap();
        let image_path = Path::new(&config.data.image_dir).join("mel_0.png");
        let prediction = engine.predict_path(&image_path).unwrap();
        assert!(metadata.class_labels.contains(&prediction.label));
        assert_eq!(prediction.probs.len(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    fn fine_tune_plan(epochs: usize) -> PhasePlan {
        PhasePlan {
            phase: TrainingPhase::FineTune,
            epochs,
            learning_rate: 3e-5,
            frozen_units: NUM_UNITS - 2,
        }
    }

    /// 検証損失の列を順に返すエポック関数。モデルはエポック番号で代用する
    fn scripted_epochs(
        val_losses: &[f64],
    ) -> impl FnMut(usize, f64) -> (usize, EpochMetrics, EpochMetrics) + '_ {
        move |model, _| {
            let epoch = model + 1;
            let valid = EpochMetrics {
                loss: val_losses[epoch - 1],
                accuracy: 0.5,
            };
            (epoch, EpochMetrics::default(), valid)
        }
    }

    #[test]
    fn test_early_stop_restores_best_epoch() {
        let val_losses = [1.0, 0.8, 0.9, 0.95, 0.85, 0.99, 0.5, 0.4];
        let mut history = Vec::new();

        let outcome = run_epochs(
            0usize,
            &fine_tune_plan(val_losses.len()),
            Some(&CallbackSettings::default()),
            &mut history,
            scripted_epochs(&val_losses),
        );

        // 最良は2エポック目、patience=4 で6エポック目に停止
        assert_eq!(outcome.model, 2);
        assert_eq!(outcome.epochs_run, 6);
        assert_eq!(history.len(), 6);
        let best = outcome.best.unwrap();
        assert_eq!(best.epoch, 2);
        assert_eq!(best.val_loss, 0.8);
    }

    #[test]
    fn test_learning_rate_reduced_on_plateau() {
        let val_losses = [1.0, 0.8, 0.9, 0.95, 0.85, 0.99];
        let mut history = Vec::new();

        run_epochs(
            0usize,
            &fine_tune_plan(val_losses.len()),
            Some(&CallbackSettings::default()),
            &mut history,
            scripted_epochs(&val_losses),
        );

        let rates: Vec<f64> = history.iter().map(|r| r.learning_rate).collect();
        // 3, 4 エポック目で改善なし -> 5 エポック目から 0.3 倍
        assert_eq!(rates[..4], [3e-5; 4]);
        assert!((rates[4] - 9e-6).abs() < 1e-15);
        assert!((rates[5] - 9e-6).abs() < 1e-15);
    }

    #[test]
    fn test_best_epoch_restored_without_early_stop() {
        let val_losses = [0.5, 0.6, 0.7];
        let mut history = Vec::new();

        let outcome = run_epochs(
            0usize,
            &fine_tune_plan(val_losses.len()),
            Some(&CallbackSettings::default()),
            &mut history,
            scripted_epochs(&val_losses),
        );

        assert_eq!(outcome.epochs_run, 3);
        assert_eq!(outcome.model, 1);
    }

    #[test]
    fn test_warmup_runs_all_epochs_and_keeps_last_model() {
        let val_losses = [0.5, 0.9, 1.2];
        let plan = PhasePlan {
            phase: TrainingPhase::Warmup,
            epochs: val_losses.len(),
            learning_rate: 1e-3,
            frozen_units: NUM_UNITS,
        };
        let mut history = Vec::new();

        let outcome = run_epochs(0usize, &plan, None, &mut history, scripted_epochs(&val_losses));

        assert_eq!(outcome.model, 3);
        assert_eq!(outcome.epochs_run, 3);
        assert!(outcome.best.is_none());
        assert!(history.iter().all(|r| r.learning_rate == 1e-3));
    }
}
