pub mod backend;
pub mod callbacks;
pub mod efficientnet;
pub mod inference;
pub mod loss;
pub mod ml_model;
pub mod training;

pub use callbacks::{EarlyStopping, ReduceLrOnPlateau, StopDecision};
pub use efficientnet::{EfficientNetB0, FEATURE_CHANNELS, NUM_UNITS};
pub use inference::{InferenceEngine, Prediction};
pub use loss::{FocalLoss, FocalLossConfig};
pub use ml_model::{LesionClassifier, ModelConfig};
pub use training::{train_model, TrainingReport};
