use crate::{
    class_registry::ClassRegistry,
    config::InferenceConfig,
    error::PredictionError,
    model_service::ModelService,
    prediction::{infer, validate_dimensions, PredictionOutcome},
    preprocessing::Transform,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, time::timeout};

/// Shared entry point for predictions. Cloning is cheap; every clone uses the
/// same model instance and worker permits.
pub struct InferenceService<M: ModelService> {
    model_service: Arc<M>,
    classes: Arc<ClassRegistry>,
    transform: Arc<Transform>,
    workers: Arc<Semaphore>,
    timeout: Duration,
    min_input_side: u32,
}

impl<M: ModelService> Clone for InferenceService<M> {
    fn clone(&self) -> Self {
        Self {
            model_service: self.model_service.clone(),
            classes: self.classes.clone(),
            transform: self.transform.clone(),
            workers: self.workers.clone(),
            timeout: self.timeout,
            min_input_side: self.min_input_side,
        }
    }
}

impl<M: ModelService> InferenceService<M> {
    pub fn new(
        model_service: M,
        classes: ClassRegistry,
        transform: Transform,
        inference_config: &InferenceConfig,
    ) -> Result<Self, PredictionError> {
        if model_service.num_classes() != classes.len() {
            return Err(PredictionError::Configuration(format!(
                "model has {} outputs but {} classes are registered",
                model_service.num_classes(),
                classes.len()
            )));
        }

        Ok(Self {
            model_service: Arc::new(model_service),
            classes: Arc::new(classes),
            transform: Arc::new(transform),
            workers: Arc::new(Semaphore::new(inference_config.max_concurrency.max(1))),
            timeout: inference_config.get_timeout(),
            min_input_side: inference_config.min_input_side,
        })
    }

    /// Reads a staged upload and classifies it.
    pub async fn predict_file(&self, path: PathBuf) -> Result<PredictionOutcome, PredictionError> {
        self.run_blocking(move || {
            std::fs::read(&path).map_err(|e| {
                PredictionError::Worker(format!("failed to read staged upload: {}", e))
            })
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn predict_bytes(
        &self,
        image_data: Vec<u8>,
    ) -> Result<PredictionOutcome, PredictionError> {
        self.run_blocking(move || Ok(image_data)).await
    }

    /// The deadline covers the wait for a worker permit as well as the work
    /// itself.
    async fn run_blocking<F>(&self, load: F) -> Result<PredictionOutcome, PredictionError>
    where
        F: FnOnce() -> Result<Vec<u8>, PredictionError> + Send + 'static,
    {
        match timeout(self.timeout, self.acquire_and_run(load)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PredictionError::Timeout(self.timeout)),
        }
    }

    /// Preprocessing and inference are CPU bound, so they run on the blocking
    /// pool. The semaphore caps how many run at once and the permit lives as
    /// long as the worker, even if the caller gave up after a timeout.
    async fn acquire_and_run<F>(&self, load: F) -> Result<PredictionOutcome, PredictionError>
    where
        F: FnOnce() -> Result<Vec<u8>, PredictionError> + Send + 'static,
    {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PredictionError::Worker(e.to_string()))?;

        let model_service = self.model_service.clone();
        let classes = self.classes.clone();
        let transform = self.transform.clone();
        let min_input_side = self.min_input_side;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let image_data = load()?;

            let (width, height) = transform.image_dimensions(&image_data)?;
            let errors = validate_dimensions(width, height, min_input_side, &transform);
            if !errors.is_empty() {
                tracing::debug!("Rejected {}x{} image: {:?}", width, height, errors);
                return Ok(PredictionOutcome::Rejected(errors));
            }

            let tensor = transform.preprocess(&image_data)?;
            tracing::debug!(
                "Preprocessed {}x{} image into {:?}",
                tensor.source_width,
                tensor.source_height,
                tensor.input.shape()
            );

            let result = infer(&*model_service, &tensor, &classes)?;
            tracing::debug!("Predicted {}", result.predicted_label);
            Ok(PredictionOutcome::Completed(result))
        });

        handle
            .await
            .map_err(|join_error| PredictionError::Worker(join_error.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TransformConfig, preprocessing::PreprocessedTensor};
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    struct MockModelService {
        delay: Duration,
    }

    impl ModelService for MockModelService {
        fn forward(&self, tensor: &PreprocessedTensor) -> Result<Vec<f32>, PredictionError> {
            std::thread::sleep(self.delay);
            let mean = tensor.input.mean().unwrap_or(0.0);
            Ok(vec![mean, 1.0, -mean, 0.5])
        }

        fn num_classes(&self) -> usize {
            4
        }
    }

    fn service(delay: Duration, timeout_ms: u64) -> InferenceService<MockModelService> {
        let classes = ClassRegistry::new(
            ["COVID", "Lung_Opacity", "Normal", "Viral Pneumonia"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .unwrap();
        let inference_config = InferenceConfig {
            max_concurrency: 2,
            timeout_ms,
            min_input_side: 32,
        };
        InferenceService::new(
            MockModelService { delay },
            classes,
            Transform::new(TransformConfig::default()).unwrap(),
            &inference_config,
        )
        .unwrap()
    }

    fn xray_png(side: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(side, side, |x, y| Luma([((x * 3 + y) % 256) as u8]));
        let mut image_data = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)
            .unwrap();
        image_data
    }

    #[tokio::test]
    async fn test_predict_bytes_is_repeatable() {
        let service = service(Duration::ZERO, 5_000);
        let image_data = xray_png(256);

        let first = service.predict_bytes(image_data.clone()).await.unwrap();
        let second = service.predict_bytes(image_data).await.unwrap();

        assert_eq!(first, second);
        match first {
            PredictionOutcome::Completed(result) => {
                assert_eq!(result.probabilities.len(), 4);
                let sum: f32 = result.probabilities.iter().map(|(_, p)| p).sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_predict_file_reads_staged_upload() {
        let service = service(Duration::ZERO, 5_000);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.png");
        std::fs::write(&path, xray_png(128)).unwrap();

        let outcome = service.predict_file(path).await.unwrap();

        assert!(matches!(outcome, PredictionOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_tiny_image_is_rejected() {
        let service = service(Duration::ZERO, 5_000);

        let outcome = service.predict_bytes(xray_png(8)).await.unwrap();

        match outcome {
            PredictionOutcome::Rejected(errors) => assert!(errors.contains_key("file")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_bytes_fail_as_invalid_image() {
        let service = service(Duration::ZERO, 5_000);

        let err = service.predict_bytes(vec![0; 100]).await.unwrap_err();

        assert!(matches!(err, PredictionError::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_slow_inference_times_out() {
        let service = service(Duration::from_millis(500), 50);

        let err = service.predict_bytes(xray_png(64)).await.unwrap_err();

        assert!(matches!(err, PredictionError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_waiting_for_a_busy_worker_times_out() {
        let service = service(Duration::ZERO, 100);
        let _busy = service.workers.clone().acquire_many_owned(2).await.unwrap();

        let outcome =
            tokio::time::timeout(Duration::from_secs(5), service.predict_bytes(xray_png(64))).await;

        assert!(matches!(outcome, Ok(Err(PredictionError::Timeout(_)))));
    }

    #[tokio::test]
    async fn test_elongated_image_is_rejected_without_resizing() {
        let service = service(Duration::ZERO, 5_000);
        let img = GrayImage::new(1, 20_000);
        let mut image_data = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)
            .unwrap();

        let outcome = service.predict_bytes(image_data).await.unwrap();

        match outcome {
            PredictionOutcome::Rejected(errors) => assert!(errors["file"].contains("1x20000")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_class_count_must_match_model() {
        let classes = ClassRegistry::new(vec!["Normal".to_string()]).unwrap();

        let result = InferenceService::new(
            MockModelService {
                delay: Duration::ZERO,
            },
            classes,
            Transform::new(TransformConfig::default()).unwrap(),
            &InferenceConfig::default(),
        );

        assert!(matches!(result, Err(PredictionError::Configuration(_))));
    }
}
