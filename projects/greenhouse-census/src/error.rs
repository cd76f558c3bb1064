//! Error taxonomy for the census pipeline.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while processing a photo session
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Malformed input image or coordinates; rejected before dispatch.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("External service '{service}' failed: {message}")]
    ExternalService {
        service: String,
        message: String,
        retryable: bool,
    },

    #[error("Model inference failed: {message}")]
    ModelInference { message: String, transient: bool },

    /// Missing or corrupt weights. Never retried.
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Persistence failed: {message}")]
    Persistence { message: String, retryable: bool },

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl PipelineError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::ResourceNotFound(msg.into())
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::ExternalService {
            service: "object-storage".to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::ModelInference {
            message: msg.into(),
            transient: false,
        }
    }

    /// Inference failures caused by resource pressure (e.g. OOM) rather than bad input.
    pub fn inference_transient<S: Into<String>>(msg: S) -> Self {
        Self::ModelInference {
            message: msg.into(),
            transient: true,
        }
    }

    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ExternalService { retryable, .. } => *retryable,
            Self::ModelInference { transient, .. } => *transient,
            Self::Persistence { retryable, .. } => *retryable,
            Self::Validation(_)
            | Self::ResourceNotFound(_)
            | Self::ModelLoad(_)
            | Self::Timeout(_) => false,
        }
    }

    /// Stable machine-readable tag, used in warning details and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::ExternalService { .. } => "external_service",
            Self::ModelInference { .. } => "model_inference",
            Self::ModelLoad(_) => "model_load",
            Self::Persistence { .. } => "persistence",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Message safe to show to API clients: no paths, ids or internals.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("invalid input: {msg}"),
            Self::ResourceNotFound(_) => "referenced resource was not found".to_string(),
            Self::ExternalService { .. } => "storage service unavailable".to_string(),
            Self::ModelInference { .. } => "image could not be analysed".to_string(),
            Self::ModelLoad(_) => "inference models are not available".to_string(),
            Self::Persistence { .. } => "results could not be saved".to_string(),
            Self::Timeout(_) => "processing timed out".to_string(),
        }
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        Self::inference(format!("image decode/encode error: {err}"))
    }
}

/// A failure confined to one container, or a missing piece of context
/// (`container_index` is `None`). Contributes to a `warning` session.
#[derive(Debug, Clone, Serialize)]
pub struct IsolatedFailure {
    pub container_index: Option<usize>,
    pub kind: &'static str,
    pub message: String,
    pub attempts: u32,
}

/// A failure that prevents any usable result. Drives the session to `failed`.
#[derive(Debug, Clone)]
pub struct FatalFailure {
    pub stage: &'static str,
    pub error: PipelineError,
}

/// Tagged failure: every propagation decision is a match on this.
#[derive(Debug, Clone)]
pub enum Failure {
    Isolated(IsolatedFailure),
    Fatal(FatalFailure),
}

impl IsolatedFailure {
    pub fn container(index: usize, error: &PipelineError, attempts: u32) -> Self {
        Self {
            container_index: Some(index),
            kind: error.kind(),
            message: error.public_message(),
            attempts,
        }
    }

    pub fn context(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            container_index: None,
            kind,
            message: message.into(),
            attempts: 0,
        }
    }
}

impl FatalFailure {
    pub fn new(stage: &'static str, error: PipelineError) -> Self {
        Self { stage, error }
    }
}

impl std::fmt::Display for FatalFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.error)
    }
}
