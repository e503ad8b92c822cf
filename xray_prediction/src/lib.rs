mod class_registry;
mod inference_service;
mod model_service;
mod ort_service;
mod prediction;
mod preprocessing;

pub mod config;
pub mod error;

pub use class_registry::{load_classes_file, resolve_classes, ClassRegistry};
pub use error::PredictionError;
pub use inference_service::InferenceService;
pub use model_service::ModelService;
pub use ort_service::{load_model, OrtModelService};
pub use prediction::{
    argmax, infer, softmax, PredictionOutcome, PredictionResult, Probabilities, ValidationErrors,
};
pub use preprocessing::{PreprocessedTensor, Transform};
