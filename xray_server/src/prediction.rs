use crate::{
    error::ApiError,
    server::SharedState,
    staging::{staging_extension, StagedUpload},
    telemetry::Metrics,
};
use axum::extract::Multipart;
use bytes::Bytes;
use std::{fmt, time::Instant};
use xray_prediction::{ModelService, PredictionOutcome, PredictionResult};

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Staged,
    Preprocessed,
    Inferred,
    Responded,
    Failed,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStage::Received => "RECEIVED",
            RequestStage::Staged => "STAGED",
            RequestStage::Preprocessed => "PREPROCESSED",
            RequestStage::Inferred => "INFERRED",
            RequestStage::Responded => "RESPONDED",
            RequestStage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Follows one prediction request through its stages and records how it
/// ended.
pub struct RequestTrace<'a> {
    route: &'static str,
    stage: RequestStage,
    started: Instant,
    metrics: &'a Metrics,
}

impl<'a> RequestTrace<'a> {
    pub fn start(route: &'static str, metrics: &'a Metrics) -> Self {
        metrics.record_request(route);
        Self {
            route,
            stage: RequestStage::Received,
            started: Instant::now(),
            metrics,
        }
    }

    pub fn advance(&mut self, stage: RequestStage) {
        tracing::debug!(route = self.route, "{} -> {}", self.stage, stage);
        self.stage = stage;
    }

    pub fn responded(mut self, outcome: &str) {
        self.advance(RequestStage::Responded);
        self.finish(outcome);
    }

    /// The single log line for a failed request, at the stage the failure
    /// happened in.
    pub fn failed(mut self, err: &ApiError) {
        let failed_at = failed_stage(err);
        let outcome = if err.status().is_server_error() {
            tracing::error!(route = self.route, "{} failed: {}", failed_at, err);
            "failed"
        } else {
            tracing::warn!(route = self.route, "{} failed: {}", failed_at, err);
            "rejected"
        };
        self.stage = RequestStage::Failed;
        self.finish(outcome);
    }

    fn finish(&self, outcome: &str) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.metrics.record_prediction_duration(elapsed_ms, self.route);
        self.metrics.record_prediction_outcome(self.route, outcome);
    }
}

fn failed_stage(err: &ApiError) -> RequestStage {
    match err {
        ApiError::MissingFile | ApiError::Upload(_) => RequestStage::Received,
        ApiError::Staging(_) => RequestStage::Staged,
        ApiError::InvalidImage(_) | ApiError::Validation(_) => RequestStage::Preprocessed,
        ApiError::Prediction(_) => RequestStage::Inferred,
        ApiError::Preview(_) => RequestStage::Responded,
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub image_data: Bytes,
}

/// Pulls the `file` field out of a multipart body. Other fields are skipped.
pub async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let image_data = field.bytes().await?;
        if image_data.is_empty() {
            return Err(ApiError::MissingFile);
        }
        return Ok(Upload {
            file_name,
            image_data,
        });
    }

    Err(ApiError::MissingFile)
}

/// Stages the upload on disk, classifies it and removes the staged copy
/// before returning, on success and on every error path.
pub async fn classify_upload<M: ModelService>(
    state: &SharedState<M>,
    upload: &Upload,
    trace: &mut RequestTrace<'_>,
) -> Result<PredictionResult, ApiError> {
    let staging_dir = state.staging_dir.clone();
    let image_data = upload.image_data.clone();
    let extension = staging_extension(upload.file_name.as_deref());

    let staged = tokio::task::spawn_blocking(move || {
        StagedUpload::stage(&staging_dir, &image_data, extension)
    })
    .await
    .map_err(|e| ApiError::Staging(std::io::Error::other(e)))?
    .map_err(ApiError::Staging)?;
    trace.advance(RequestStage::Staged);

    let outcome = state.inference_service.predict_file(staged.path()).await;
    drop(staged);

    match outcome? {
        PredictionOutcome::Completed(result) => {
            trace.advance(RequestStage::Preprocessed);
            trace.advance(RequestStage::Inferred);
            Ok(result)
        }
        PredictionOutcome::Rejected(errors) => Err(ApiError::Validation(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use xray_prediction::{PredictionError, ValidationErrors};

    #[test]
    fn test_stage_names() {
        assert_eq!(RequestStage::Received.to_string(), "RECEIVED");
        assert_eq!(RequestStage::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_failures_are_attributed_to_their_stage() {
        assert_eq!(failed_stage(&ApiError::MissingFile), RequestStage::Received);
        assert_eq!(
            failed_stage(&ApiError::Staging(std::io::Error::other("disk full"))),
            RequestStage::Staged
        );
        assert_eq!(
            failed_stage(&ApiError::from(PredictionError::InvalidImage(
                "bad header".to_string()
            ))),
            RequestStage::Preprocessed
        );
        assert_eq!(
            failed_stage(&ApiError::Validation(ValidationErrors::new())),
            RequestStage::Preprocessed
        );
        assert_eq!(
            failed_stage(&ApiError::from(PredictionError::Timeout(
                std::time::Duration::from_millis(10)
            ))),
            RequestStage::Inferred
        );
        assert_eq!(
            failed_stage(&ApiError::from(PredictionError::Inference(
                "session failed".to_string()
            ))),
            RequestStage::Inferred
        );
    }
}
