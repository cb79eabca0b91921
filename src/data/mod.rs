//! 学習データの読み込みと前処理

pub mod dataset;
pub mod metadata;
pub mod preprocess;
pub mod split;
pub mod vocabulary;

pub use dataset::{LesionBatch, LesionBatcher, LesionDataset, LesionItem};
pub use metadata::{class_counts, load_metadata_csv, verify_images_exist, LesionRecord};
pub use preprocess::{decode_and_normalize, load_and_normalize_image};
pub use split::stratified_split;
pub use vocabulary::LabelVocabulary;
