use crate::error::PredictionError;
use serde_json::Value;
use std::{
    collections::HashSet,
    fs,
    path::Path,
};

const CLASSES_KEY: &str = "classes";

/// Ordered output labels of a loaded model. Index `i` is the model's output
/// dimension `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRegistry {
    class_labels: Vec<String>,
}

impl ClassRegistry {
    pub fn new(class_labels: Vec<String>) -> Result<Self, PredictionError> {
        if class_labels.is_empty() {
            return Err(PredictionError::Configuration(
                "class list is empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for label in &class_labels {
            if label.trim().is_empty() {
                return Err(PredictionError::Configuration(
                    "class list contains a blank label".to_string(),
                ));
            }
            if !seen.insert(label.as_str()) {
                return Err(PredictionError::Configuration(format!(
                    "class list contains duplicate label {:?}",
                    label
                )));
            }
        }

        Ok(Self { class_labels })
    }

    pub fn get_labels(&self) -> &[String] {
        &self.class_labels
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.class_labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.class_labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_labels.is_empty()
    }
}

/// Resolves the class list, preferring the value embedded in the model
/// artifact and falling back to the external classes file.
pub fn resolve_classes(
    embedded: Option<&str>,
    classes_file: &Path,
) -> Result<ClassRegistry, PredictionError> {
    if let Some(raw) = embedded {
        match parse_json_classes(raw).and_then(ClassRegistry::new) {
            Ok(registry) => {
                tracing::info!(
                    "Using {} classes embedded in the model artifact",
                    registry.len()
                );
                return Ok(registry);
            }
            Err(e) => {
                tracing::warn!(
                    "Ignoring classes embedded in the model artifact: {}. Falling back to {:?}",
                    e,
                    classes_file
                );
            }
        }
    }

    let registry = load_classes_file(classes_file)?;
    tracing::info!(
        "Loaded {} classes from {:?}",
        registry.len(),
        classes_file
    );
    Ok(registry)
}

pub fn load_classes_file(filepath: &Path) -> Result<ClassRegistry, PredictionError> {
    let contents = fs::read_to_string(filepath).map_err(|e| {
        PredictionError::Configuration(format!(
            "Failed to read classes file {:?}: {}",
            filepath, e
        ))
    })?;

    let is_text = filepath
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));

    let labels = if is_text {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        parse_json_classes(&contents)?
    };

    ClassRegistry::new(labels)
}

fn parse_json_classes(raw: &str) -> Result<Vec<String>, PredictionError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| PredictionError::Configuration(format!("Invalid classes JSON: {}", e)))?;

    let value = match value {
        Value::Object(mut wrapper) if wrapper.contains_key(CLASSES_KEY) => wrapper
            .remove(CLASSES_KEY)
            .unwrap_or(Value::Null),
        other => other,
    };

    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(label) => Ok(label),
                other => Err(PredictionError::Configuration(format!(
                    "Class label must be a string, got {}",
                    other
                ))),
            })
            .collect(),
        other => Err(PredictionError::Configuration(format!(
            "Expected a list of classes, got {}",
            other
        ))),
    }
}
