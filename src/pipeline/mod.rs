pub mod dispatch;
pub mod enrich;
pub mod ingest;

pub use dispatch::{DispatchOutcome, SearchDispatchPipeline};
pub use enrich::{EnrichOutcome, EnrichmentPipeline, ObjectEvent};
pub use ingest::{IngestOutcome, IngestionPipeline};

use crate::backends::BackendError;
use crate::models::StageReport;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;
use std::{future::Future, time::Instant};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// The record an enrichment targets has not been committed yet.
    NotFoundYet,
    /// Search provider, storage, transport or classifier failure.
    Downstream,
    Internal,
}

impl PipelineError {
    pub fn not_found_yet(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::NotFoundYet,
        }
    }

    pub fn downstream(stage: &'static str, err: BackendError) -> Self {
        Self {
            stage,
            message: err.to_string(),
            kind: PipelineErrorKind::Downstream,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    /// Whether redelivering the same trigger can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            PipelineErrorKind::NotFoundYet | PipelineErrorKind::Downstream
        )
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    pub fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

pub(crate) async fn capture_stage<T, Fut>(
    name: &'static str,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, PipelineError>
where
    Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
{
    let started = Instant::now();
    let outcome = fut.await?;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, outcome.output));
    Ok(outcome.value)
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message carried no data")]
    Missing,
    #[error("data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("data is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("data is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decodes a base64 UTF-8 JSON trigger payload.
pub fn decode_message(data: Option<&str>) -> Result<Value, DecodeError> {
    let encoded = data
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::Missing)?;
    let bytes = BASE64.decode(encoded)?;
    let text = String::from_utf8(bytes)?;
    Ok(serde_json::from_str(&text)?)
}

pub fn encode_message(payload: &[u8]) -> String {
    BASE64.encode(payload)
}
