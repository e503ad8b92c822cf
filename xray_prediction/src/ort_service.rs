use crate::{
    class_registry::{resolve_classes, ClassRegistry},
    config::{ClassesConfig, ModelConfig, Validatable},
    error::PredictionError,
    model_service::ModelService,
    preprocessing::{PreprocessedTensor, Transform},
};
use ndarray::{Array, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

const CLASSES_METADATA_KEY: &str = "classes";

/// ONNX Runtime backed classifier. The graph is loaded `num_instances` times
/// and requests are spread round-robin over the sessions.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    num_classes: usize,
}

/// Loads the model artifact, resolves its classes and checks that the output
/// layer is as wide as the class list.
pub fn load_model(
    model_config: &ModelConfig,
    classes_config: &ClassesConfig,
    transform: &Transform,
) -> Result<(OrtModelService, ClassRegistry), PredictionError> {
    let sessions = open_sessions(model_config)?;
    let embedded = sessions.first().and_then(embedded_classes);
    let classes = resolve_classes(embedded.as_deref(), &classes_config.get_path())?;

    let model_service = OrtModelService::new(sessions, classes.len(), transform)?;
    Ok((model_service, classes))
}

fn open_sessions(model_config: &ModelConfig) -> Result<Vec<Session>, PredictionError> {
    model_config.validate().map_err(PredictionError::ModelLoad)?;

    let model_path = model_config.get_path();
    let num_instances = model_config.num_instances;
    let sessions = (0..num_instances)
        .map(|_| {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(&model_path)?;
            Ok(session)
        })
        .collect::<Result<Vec<_>, ort::Error>>()
        .map_err(|e| {
            PredictionError::ModelLoad(format!("Failed to load {:?}: {}", model_path, e))
        })?;

    tracing::info!("Created {} ONNX sessions from {:?}", num_instances, model_path);
    Ok(sessions)
}

fn embedded_classes(session: &Session) -> Option<String> {
    let metadata = match session.metadata() {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!("Could not read model metadata: {}", e);
            return None;
        }
    };

    match metadata.custom(CLASSES_METADATA_KEY) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Could not read embedded classes: {}", e);
            None
        }
    }
}

impl OrtModelService {
    pub fn new(
        sessions: Vec<Session>,
        num_classes: usize,
        transform: &Transform,
    ) -> Result<Self, PredictionError> {
        if sessions.is_empty() {
            return Err(PredictionError::ModelLoad(
                "at least one session is required".to_string(),
            ));
        }

        let model_service = Self {
            sessions: Arc::new(
                sessions
                    .into_iter()
                    .map(|session| Arc::new(Mutex::new(session)))
                    .collect(),
            ),
            counter: Arc::new(AtomicUsize::new(0)),
            num_classes,
        };

        let warmup = Array::zeros(transform.input_shape());
        let scores = model_service
            .run_inference(&warmup)
            .map_err(|e| PredictionError::ModelLoad(format!("Warm-up inference failed: {}", e)))?;
        if scores.len() != num_classes {
            return Err(PredictionError::ModelLoad(format!(
                "model produces {} scores but {} classes are registered",
                scores.len(),
                num_classes
            )));
        }

        Ok(model_service)
    }

    pub fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<Vec<f32>, PredictionError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| PredictionError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| PredictionError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| PredictionError::Inference(format!("inference failed: {}", e)))?;

        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PredictionError::Inference(format!("failed to extract tensor: {}", e)))?;

        Ok(data.to_vec())
    }
}

impl ModelService for OrtModelService {
    fn forward(&self, tensor: &PreprocessedTensor) -> Result<Vec<f32>, PredictionError> {
        self.run_inference(&tensor.input)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}
