//! Batch coordination: fan-out, deduplication, aggregation.
//!
//! Each request becomes one task in a `JoinSet`. Deduplication falls out
//! of the cache: identical (document, statement, version) requests land
//! on the same fingerprint and coalesce onto one computation. Output
//! order always matches input order regardless of completion order.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::{InferenceBackend, InferenceError};
use crate::config::{ConfigError, CoreConfig};
use crate::document::Fingerprint;
use crate::schema::{SchemaRegistry, StatementType};

use super::cache::{CacheStatus, ResultCache};
use super::cancel::CancelSignal;
use super::engine::ExtractionEngine;
use super::retry::RetryController;
use super::strategy::StrategyLadder;
use super::types::{
    DocumentResult, ExtractionRequest, FailureCause, PipelineFailure,
};

/// Final per-request entry in a batch report.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOutcome {
    pub document_id: Uuid,
    pub statement: StatementType,
    pub fingerprint: Fingerprint,
    pub cache: CacheStatus,
    pub result: DocumentResult,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub min_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

impl LatencySummary {
    fn from_samples(mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self {
                min_ms: 0,
                p50_ms: 0,
                p95_ms: 0,
                max_ms: 0,
            };
        }
        samples.sort_unstable();
        let pick = |q: f64| {
            let ix = ((samples.len() - 1) as f64 * q).round() as usize;
            samples[ix]
        };
        Self {
            min_ms: samples[0],
            p50_ms: pick(0.50),
            p95_ms: pick(0.95),
            max_ms: samples[samples.len() - 1],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchMetrics {
    pub total: usize,
    pub validated: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cache_hits: usize,
    pub success_rate: f64,
    pub mean_attempts: f64,
    pub latency: LatencySummary,
    pub wall_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub outcomes: Vec<DocumentOutcome>,
    pub metrics: BatchMetrics,
}

pub struct PipelineCoordinator {
    engine: Arc<ExtractionEngine>,
    controller: Arc<RetryController>,
    cache: Arc<ResultCache>,
    registry: Arc<SchemaRegistry>,
    ladder: StrategyLadder,
}

impl PipelineCoordinator {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        registry: Arc<SchemaRegistry>,
        config: &CoreConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let engine = Arc::new(ExtractionEngine::new(
            backend,
            config.concurrency,
            config.inference_timeout(),
        ));
        Ok(Self {
            controller: Arc::new(RetryController::new(engine.clone(), config)),
            cache: Arc::new(ResultCache::from_config(config)),
            registry,
            engine,
            ladder: StrategyLadder::standard(),
        })
    }

    pub fn with_ladder(mut self, ladder: StrategyLadder) -> Self {
        self.ladder = ladder;
        self
    }

    /// Probe the backend before committing to a batch.
    pub async fn healthy(&self) -> Result<(), InferenceError> {
        self.engine.healthy().await
    }

    /// Run a batch to completion (or cancellation). Outcomes come back
    /// in input order; the report aggregates counts and latency.
    pub async fn run_batch(
        &self,
        requests: Vec<ExtractionRequest>,
        cancel: &CancelSignal,
    ) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let span = info_span!("batch", %batch_id, requests = requests.len());
        let started = Instant::now();

        let total = requests.len();
        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let controller = self.controller.clone();
            let cache = self.cache.clone();
            let schema = self
                .registry
                .get(&request.statement, request.schema_version);
            let ladder = self.ladder.clone();
            let cancel = cancel.clone();

            tasks.spawn(
                async move {
                    let outcome =
                        run_one(&controller, &cache, schema, &ladder, &cancel, request).await;
                    (index, outcome)
                }
                .instrument(span.clone()),
            );
        }

        let mut slots: Vec<Option<DocumentOutcome>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(error = %e, "batch task aborted"),
            }
        }
        let outcomes: Vec<DocumentOutcome> = slots.into_iter().flatten().collect();

        let metrics = aggregate(&outcomes, total, started.elapsed().as_millis() as u64);
        info!(
            parent: &span,
            validated = metrics.validated,
            failed = metrics.failed,
            cancelled = metrics.cancelled,
            cache_hits = metrics.cache_hits,
            wall_ms = metrics.wall_ms,
            "batch finished"
        );

        BatchReport {
            batch_id,
            outcomes,
            metrics,
        }
    }
}

async fn run_one(
    controller: &RetryController,
    cache: &ResultCache,
    schema: Option<Arc<crate::schema::SchemaDefinition>>,
    ladder: &StrategyLadder,
    cancel: &CancelSignal,
    request: ExtractionRequest,
) -> DocumentOutcome {
    let started = Instant::now();
    let document_id = request.document.id();
    let statement = request.statement.clone();
    let fingerprint = request.fingerprint(&ladder.id());

    // An unknown schema is the caller's mistake, not the document's:
    // fail before touching the cache or the backend.
    let Some(schema) = schema else {
        return DocumentOutcome {
            document_id,
            statement: statement.clone(),
            fingerprint,
            cache: CacheStatus::Computed,
            result: DocumentResult::Failed {
                failure: PipelineFailure::NonRetryable {
                    cause: FailureCause::SchemaUnavailable {
                        statement: statement.to_string(),
                        version: request.schema_version,
                    },
                },
                attempts: vec![],
            },
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
    };

    let compute = controller.run(&request, &schema, ladder, cancel);
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        outcome = cache.get_or_compute(fingerprint, request.force_refresh, compute) => Some(outcome),
    };

    let (result, cache_status) = match outcome {
        Some(outcome) => (outcome.result, outcome.status),
        None => (
            DocumentResult::Failed {
                failure: PipelineFailure::Cancelled,
                attempts: vec![],
            },
            CacheStatus::Computed,
        ),
    };

    DocumentOutcome {
        document_id,
        statement,
        fingerprint,
        cache: cache_status,
        result,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

fn aggregate(outcomes: &[DocumentOutcome], total: usize, wall_ms: u64) -> BatchMetrics {
    let mut validated = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;
    let mut cache_hits = 0usize;
    let mut attempt_total = 0usize;
    let mut latencies = Vec::with_capacity(outcomes.len());

    for outcome in outcomes {
        match &outcome.result {
            DocumentResult::Validated(_) => validated += 1,
            DocumentResult::Failed {
                failure: PipelineFailure::Cancelled,
                ..
            } => cancelled += 1,
            DocumentResult::Failed { .. } => failed += 1,
        }
        if outcome.cache.from_cache() {
            cache_hits += 1;
        }
        attempt_total += outcome.result.attempts().len();
        latencies.push(outcome.elapsed_ms);
    }

    let success_rate = if total == 0 {
        0.0
    } else {
        validated as f64 / total as f64
    };
    let mean_attempts = if outcomes.is_empty() {
        0.0
    } else {
        attempt_total as f64 / outcomes.len() as f64
    };

    BatchMetrics {
        total,
        validated,
        failed,
        cancelled,
        cache_hits,
        success_rate,
        mean_attempts,
        latency: LatencySummary::from_samples(latencies),
        wall_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::document::Document;
    use crate::pipeline::cancel::cancel_pair;
    use crate::schema::SchemaVersion;
    use std::time::Duration;

    const GOOD: &str =
        r#"{"total_assets": 1000.0, "total_liabilities": 600.0, "total_equity": 400.0}"#;

    fn config() -> CoreConfig {
        CoreConfig {
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            inference_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn coordinator(backend: Arc<ScriptedBackend>) -> PipelineCoordinator {
        PipelineCoordinator::new(
            backend,
            Arc::new(SchemaRegistry::builtin()),
            &config(),
        )
        .unwrap()
    }

    fn request(text: &str) -> ExtractionRequest {
        ExtractionRequest::new(
            Arc::new(Document::from_text(text)),
            StatementType::BalanceSheet,
            SchemaVersion(1),
        )
    }

    #[tokio::test]
    async fn outcomes_preserve_input_order() {
        let backend = Arc::new(ScriptedBackend::always(GOOD));
        let coordinator = coordinator(backend);

        let requests: Vec<_> = (0..5)
            .map(|n| request(&format!("Statement number {n}")))
            .collect();
        let expected_ids: Vec<_> = requests.iter().map(|r| r.document.id()).collect();

        let report = coordinator.run_batch(requests, &CancelSignal::none()).await;
        let actual_ids: Vec<_> = report.outcomes.iter().map(|o| o.document_id).collect();
        assert_eq!(actual_ids, expected_ids);
        assert_eq!(report.metrics.validated, 5);
        assert!((report.metrics.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duplicate_requests_share_one_computation() {
        let backend = Arc::new(ScriptedBackend::always(GOOD));
        let coordinator = coordinator(backend.clone());

        let document = Arc::new(Document::from_text("Total assets: 1,000"));
        let requests = vec![
            ExtractionRequest::new(document.clone(), StatementType::BalanceSheet, SchemaVersion(1)),
            ExtractionRequest::new(document, StatementType::BalanceSheet, SchemaVersion(1)),
        ];

        let report = coordinator.run_batch(requests, &CancelSignal::none()).await;
        assert_eq!(report.metrics.validated, 2);
        assert_eq!(backend.calls(), 1, "identical requests must deduplicate");
        assert_eq!(report.metrics.cache_hits, 1);
    }

    #[tokio::test]
    async fn unknown_schema_fails_without_inference() {
        let backend = Arc::new(ScriptedBackend::always(GOOD));
        let coordinator = coordinator(backend.clone());

        let mut req = request("Some document");
        req.schema_version = SchemaVersion(42);
        let report = coordinator.run_batch(vec![req], &CancelSignal::none()).await;

        assert_eq!(report.metrics.failed, 1);
        match &report.outcomes[0].result {
            DocumentResult::Failed { failure, .. } => {
                assert!(matches!(
                    failure,
                    PipelineFailure::NonRetryable {
                        cause: FailureCause::SchemaUnavailable { .. }
                    }
                ));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(backend.calls(), 0, "no inference for unknown schemas");
    }

    #[tokio::test]
    async fn cancellation_drains_the_batch_quickly() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .then_hang()
                .then_hang()
                .then_hang()
                .finally(GOOD),
        );
        let coordinator = Arc::new(coordinator(backend));
        let (handle, signal) = cancel_pair();

        let requests: Vec<_> = (0..3).map(|n| request(&format!("doc {n}"))).collect();
        let batch = {
            let coordinator = coordinator.clone();
            let signal = signal.clone();
            tokio::spawn(async move { coordinator.run_batch(requests, &signal).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let report = tokio::time::timeout(Duration::from_secs(2), batch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.metrics.cancelled, 3);
        assert_eq!(report.metrics.validated, 0);

        // A fresh batch over the same content proceeds from scratch.
        let report = coordinator
            .run_batch(vec![request("doc 0")], &CancelSignal::none())
            .await;
        assert_eq!(report.metrics.validated, 1);
    }

    #[tokio::test]
    async fn empty_batch_produces_empty_report() {
        let backend = Arc::new(ScriptedBackend::always(GOOD));
        let coordinator = coordinator(backend);
        let report = coordinator.run_batch(vec![], &CancelSignal::none()).await;
        assert_eq!(report.metrics.total, 0);
        assert_eq!(report.metrics.success_rate, 0.0);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn latency_summary_percentiles() {
        let summary = LatencySummary::from_samples(vec![10, 20, 30, 40, 100]);
        assert_eq!(summary.min_ms, 10);
        assert_eq!(summary.p50_ms, 30);
        assert_eq!(summary.max_ms, 100);
        assert!(summary.p95_ms >= summary.p50_ms);
    }
}
