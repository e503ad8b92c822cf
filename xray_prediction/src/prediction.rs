use crate::{
    class_registry::ClassRegistry, error::PredictionError, model_service::ModelService,
    preprocessing::{PreprocessedTensor, Transform},
};
use serde::{ser::SerializeMap, Serialize, Serializer};
use std::collections::BTreeMap;

/// Per-class probabilities in class registry order. Serialized as a JSON
/// object keyed by label.
#[derive(Debug, Clone, PartialEq)]
pub struct Probabilities(Vec<(String, f32)>);

impl Probabilities {
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(label, p)| (label.as_str(), *p))
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.iter().find(|(l, _)| *l == label).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Probabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, p) in &self.0 {
            map.serialize_entry(label, p)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub predicted_label: String,
    pub probabilities: Probabilities,
}

/// Field name to message, serialized as the `errors` object of a rejected
/// request.
pub type ValidationErrors = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub enum PredictionOutcome {
    Completed(PredictionResult),
    Rejected(ValidationErrors),
}

/// Runs the model on one tensor and turns its scores into a probability
/// distribution over the registered classes.
pub fn infer<M: ModelService>(
    model_service: &M,
    tensor: &PreprocessedTensor,
    classes: &ClassRegistry,
) -> Result<PredictionResult, PredictionError> {
    let logits = model_service.forward(tensor)?;
    if logits.len() != classes.len() {
        return Err(PredictionError::Inference(format!(
            "model returned {} scores for {} classes",
            logits.len(),
            classes.len()
        )));
    }

    let probs = softmax(&logits)?;
    PredictionResult::from_probabilities(classes, probs)
}

impl PredictionResult {
    /// Pairs a probability vector in registry order with its labels and picks
    /// the most likely one.
    pub fn from_probabilities(
        classes: &ClassRegistry,
        probs: Vec<f32>,
    ) -> Result<Self, PredictionError> {
        if probs.len() != classes.len() {
            return Err(PredictionError::Inference(format!(
                "{} probabilities for {} classes",
                probs.len(),
                classes.len()
            )));
        }
        let pred_idx = argmax(&probs)
            .ok_or_else(|| PredictionError::Inference("model returned no scores".to_string()))?;

        let probabilities = classes
            .get_labels()
            .iter()
            .cloned()
            .zip(probs)
            .collect::<Vec<_>>();

        Ok(Self {
            predicted_label: classes.get_labels()[pred_idx].clone(),
            probabilities: Probabilities(probabilities),
        })
    }
}

pub fn softmax(logits: &[f32]) -> Result<Vec<f32>, PredictionError> {
    if logits.iter().any(|v| !v.is_finite()) {
        return Err(PredictionError::Inference(
            "model returned non-finite scores".to_string(),
        ));
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();

    Ok(exps.into_iter().map(|v| v / sum).collect())
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, &value)| match best {
            Some((_, best_value)) if value <= best_value => best,
            _ => Some((index, value)),
        })
        .map(|(index, _)| index)
}

/// Checks the upload's dimensions, read from its header, against what makes
/// a prediction meaningful and what preprocessing can handle.
pub fn validate_dimensions(
    width: u32,
    height: u32,
    min_input_side: u32,
    transform: &Transform,
) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    let problem = if width.min(height) < min_input_side {
        Some(format!(
            "image is {}x{} pixels, the shorter side must be at least {} pixels",
            width, height, min_input_side
        ))
    } else {
        transform.check_dimensions(width, height).err()
    };
    if let Some(message) = problem {
        errors.insert("file".to_string(), message);
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use ndarray::Array;

    struct FixedLogits(Vec<f32>);

    impl ModelService for FixedLogits {
        fn forward(&self, _tensor: &PreprocessedTensor) -> Result<Vec<f32>, PredictionError> {
            Ok(self.0.clone())
        }

        fn num_classes(&self) -> usize {
            self.0.len()
        }
    }

    fn registry() -> ClassRegistry {
        ClassRegistry::new(
            ["COVID", "Lung_Opacity", "Normal", "Viral Pneumonia"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .unwrap()
    }

    fn tensor(width: u32, height: u32) -> PreprocessedTensor {
        PreprocessedTensor {
            input: Array::zeros((1, 3, 4, 4)),
            source_width: width,
            source_height: height,
        }
    }

    #[test]
    fn test_infer_returns_distribution_over_registry() {
        let model = FixedLogits(vec![0.3, 2.5, -1.0, 0.1]);

        let result = infer(&model, &tensor(224, 224), &registry()).unwrap();

        assert_eq!(result.predicted_label, "Lung_Opacity");
        let labels: Vec<&str> = result.probabilities.iter().map(|(l, _)| l).collect();
        assert_eq!(labels, ["COVID", "Lung_Opacity", "Normal", "Viral Pneumonia"]);

        let sum: f32 = result.probabilities.iter().map(|(_, p)| p).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(result.probabilities.iter().all(|(_, p)| p >= 0.0));

        let max = result
            .probabilities
            .iter()
            .map(|(_, p)| p)
            .fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(result.probabilities.get(&result.predicted_label), Some(max));
    }

    #[test]
    fn test_softmax_is_stable_for_large_logits() {
        let probs = softmax(&[1000.0, 1000.0, -1000.0]).unwrap();

        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!((probs[1] - 0.5).abs() < 1e-6);
        assert_eq!(probs[2], 0.0);
    }

    #[test]
    fn test_softmax_rejects_non_finite_scores() {
        let err = softmax(&[0.0, f32::NAN]).unwrap_err();
        assert!(matches!(err, PredictionError::Inference(_)));
    }

    #[test]
    fn test_argmax_ties_go_to_lowest_index() {
        assert_eq!(argmax(&[0.25, 0.25, 0.25, 0.25]), Some(0));
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_score_count_mismatch_is_inference_error() {
        let model = FixedLogits(vec![0.1, 0.2, 0.3]);

        let err = infer(&model, &tensor(224, 224), &registry()).unwrap_err();

        assert!(matches!(err, PredictionError::Inference(_)));
        assert!(!err.is_client_fault());
    }

    #[test]
    fn test_probabilities_serialize_in_registry_order() {
        let model = FixedLogits(vec![0.0, 0.0, 0.0, 0.0]);
        let result = infer(&model, &tensor(224, 224), &registry()).unwrap();

        let json = serde_json::to_string(&result.probabilities).unwrap();

        assert_eq!(
            json,
            r#"{"COVID":0.25,"Lung_Opacity":0.25,"Normal":0.25,"Viral Pneumonia":0.25}"#
        );
    }

    #[test]
    fn test_validate_dimensions() {
        let transform = Transform::new(TransformConfig::default()).unwrap();

        assert!(validate_dimensions(224, 224, 32, &transform).is_empty());

        let errors = validate_dimensions(640, 16, 32, &transform);
        assert!(errors["file"].contains("640x16"));
        assert!(errors["file"].contains("at least 32"));

        let errors = validate_dimensions(100, 20_000, 32, &transform);
        assert!(errors["file"].contains("100x20000"));
    }
}
