use crate::{error::PredictionError, preprocessing::PreprocessedTensor};

/// A loaded classifier. Implementations are immutable after construction and
/// are called concurrently from blocking worker threads.
pub trait ModelService: Send + Sync + 'static {
    /// Raw per-class scores (logits) for a batch of one.
    fn forward(&self, tensor: &PreprocessedTensor) -> Result<Vec<f32>, PredictionError>;

    fn num_classes(&self) -> usize;
}
