use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use xray_prediction::{PredictionError, ValidationErrors};

const PREDICTION_FAILED: &str = "Error while making prediction";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No image file was uploaded")]
    MissingFile,
    #[error("Upload could not be read: {0}")]
    Upload(#[from] MultipartError),
    #[error("Uploaded image could not be decoded: {0}")]
    InvalidImage(PredictionError),
    #[error("Prediction validation error: {0:?}")]
    Validation(ValidationErrors),
    #[error("Prediction failed: {0}")]
    Prediction(PredictionError),
    #[error("Failed to stage upload: {0}")]
    Staging(std::io::Error),
    #[error("Failed to store preview image: {0}")]
    Preview(std::io::Error),
}

impl From<PredictionError> for ApiError {
    fn from(err: PredictionError) -> Self {
        if err.is_client_fault() {
            ApiError::InvalidImage(err)
        } else {
            ApiError::Prediction(err)
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFile | ApiError::InvalidImage(_) | ApiError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Upload(err) => err.status(),
            ApiError::Prediction(_) | ApiError::Staging(_) | ApiError::Preview(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// What the client gets to see. Internal failures collapse into one
    /// generic message.
    pub fn detail(&self) -> Value {
        match self {
            ApiError::MissingFile => json!("No image file was uploaded"),
            ApiError::Upload(err) => json!(err.body_text()),
            ApiError::InvalidImage(_) => json!("Uploaded file is not a readable image"),
            ApiError::Validation(errors) => json!(errors),
            ApiError::Prediction(_) | ApiError::Staging(_) | ApiError::Preview(_) => {
                json!(PREDICTION_FAILED)
            }
        }
    }

    /// `detail` flattened to one line for the HTML error page.
    pub fn message(&self) -> String {
        match self {
            ApiError::Validation(errors) => errors
                .iter()
                .map(|(field, message)| format!("{}: {}", field, message))
                .collect::<Vec<_>>()
                .join("; "),
            _ => match self.detail() {
                Value::String(message) => message,
                other => other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_hide_details() {
        let err = ApiError::from(PredictionError::Inference(
            "failed to extract tensor from /srv/models/x.onnx".to_string(),
        ));

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail(), json!(PREDICTION_FAILED));
    }

    #[test]
    fn test_client_faults_are_bad_requests() {
        let err = ApiError::from(PredictionError::InvalidImage("bad png".to_string()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(!err.detail().to_string().contains("bad png"));

        let mut errors = ValidationErrors::new();
        errors.insert("file".to_string(), "too small".to_string());
        let err = ApiError::Validation(errors);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.detail(), json!({ "file": "too small" }));
    }
}
