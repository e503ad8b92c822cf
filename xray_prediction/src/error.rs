use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Model load error: {0}")]
    ModelLoad(String),
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("Inference worker failed: {0}")]
    Worker(String),
}

impl PredictionError {
    /// True when the failure was caused by what the client uploaded rather
    /// than by the service.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, PredictionError::InvalidImage(_))
    }
}

impl From<ort::Error> for PredictionError {
    fn from(err: ort::Error) -> Self {
        PredictionError::Inference(err.to_string())
    }
}
