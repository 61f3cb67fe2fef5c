//! The extraction engine: one prompt round against the model backend.
//!
//! The engine owns the global inference concurrency cap. A permit is held
//! only for the duration of the backend call; parsing, validation, and
//! retry backoff never occupy an inference slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::backend::{InferenceBackend, InferenceError};
use crate::schema::SchemaDefinition;

use super::parser::parse_record;
use super::prompt::build_prompt;
use super::strategy::StrategyKind;
use super::types::{CandidateRecord, ExtractionRequest, Provenance};

pub struct ExtractionEngine {
    backend: Arc<dyn InferenceBackend>,
    limiter: Arc<Semaphore>,
    timeout: Duration,
}

impl ExtractionEngine {
    pub fn new(backend: Arc<dyn InferenceBackend>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            backend,
            limiter: Arc::new(Semaphore::new(concurrency)),
            timeout,
        }
    }

    /// Run one extraction attempt: render the prompt for the given
    /// strategy, call the backend under the concurrency cap and the
    /// per-attempt deadline, and map the completion onto the schema.
    pub async fn extract(
        &self,
        request: &ExtractionRequest,
        schema: &SchemaDefinition,
        strategy: StrategyKind,
        attempt: u32,
    ) -> Result<CandidateRecord, InferenceError> {
        let prompt = build_prompt(schema, strategy, request.document.content());

        let raw = {
            let _permit = self
                .limiter
                .acquire()
                .await
                .map_err(|_| InferenceError::BackendUnavailable("engine shut down".into()))?;

            let started = Instant::now();
            let raw = tokio::time::timeout(self.timeout, self.backend.infer(&prompt))
                .await
                .map_err(|_| InferenceError::Timeout {
                    elapsed_secs: self.timeout.as_secs(),
                })??;

            debug!(
                doc_id = %request.document.id(),
                statement = %request.statement,
                %strategy,
                attempt,
                latency_ms = started.elapsed().as_millis() as u64,
                "inference round completed"
            );
            raw
        };

        let provenance = Provenance {
            strategy,
            attempt,
            extracted_at: Utc::now(),
        };
        parse_record(&raw, schema, provenance)
    }

    /// Probe the backend before starting a batch.
    pub async fn healthy(&self) -> Result<(), InferenceError> {
        self.backend.healthy().await
    }
}
