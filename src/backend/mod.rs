//! Model backend abstraction.
//!
//! The pipeline talks to inference through [`InferenceBackend`] so tests
//! can script responses and failures without a running model server.

pub mod http;
pub mod mock;

pub use http::HttpBackend;
pub use mock::ScriptedBackend;

use serde::Serialize;
use thiserror::Error;

/// Fully rendered prompt pair handed to the backend.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub system: String,
    pub user: String,
}

/// Failures surfaced by a backend call. Cloneable so attempt records can
/// carry the cause alongside the live error.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum InferenceError {
    #[error("inference timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("model produced unusable output: {0}")]
    MalformedOutput(String),
}

/// One round of model inference: prompt in, raw completion text out.
#[async_trait::async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(&self, prompt: &PromptContext) -> Result<String, InferenceError>;

    /// Cheap reachability probe, used at startup before a batch begins.
    async fn healthy(&self) -> Result<(), InferenceError>;
}
