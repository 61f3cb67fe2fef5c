//! Retry and escalation control.
//!
//! Drives one request through up to `max_attempts` engine rounds:
//!
//!   pending -> in_flight -> validated
//!                        -> retrying (backoff, maybe escalate) -> in_flight
//!                        -> failed
//!
//! Content failures (malformed output, bounded arithmetic misses) climb
//! the strategy ladder; transport failures retry on the same rung.
//! Fatal validation outcomes and out-of-bound misses stop immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use crate::backend::InferenceError;
use crate::config::CoreConfig;
use crate::schema::SchemaDefinition;

use super::cancel::CancelSignal;
use super::engine::ExtractionEngine;
use super::strategy::StrategyLadder;
use super::types::{
    AttemptOutcome, AttemptRecord, DocumentResult, ExtractionRequest, FailureCause,
    PipelineFailure, RequestState, ValidatedRecord, ValidationReport, ViolationKind,
};
use super::validator::Validator;

pub struct RetryController {
    engine: Arc<ExtractionEngine>,
    validator: Validator,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    recoverable_miss_factor: f64,
}

impl RetryController {
    pub fn new(engine: Arc<ExtractionEngine>, config: &CoreConfig) -> Self {
        Self {
            engine,
            validator: Validator::from_config(config),
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            recoverable_miss_factor: config.recoverable_miss_factor,
        }
    }

    /// Drive one request to a terminal result. Infallible in the Result
    /// sense: every failure mode is encoded in [`DocumentResult`].
    pub async fn run(
        &self,
        request: &ExtractionRequest,
        schema: &SchemaDefinition,
        ladder: &StrategyLadder,
        cancel: &CancelSignal,
    ) -> DocumentResult {
        let doc_id = request.document.id();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut escalations = 0usize;
        let mut last_cause: Option<FailureCause> = None;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return cancelled(attempts);
            }

            let strategy = ladder.tier(escalations);
            info!(%doc_id, attempt, %strategy, state = %RequestState::InFlight, "starting attempt");

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return cancelled(attempts),
                outcome = self.engine.extract(request, schema, strategy, attempt) => outcome,
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(record) => {
                    let (record, report) = self.validator.validate(record, schema);
                    if report.passed() {
                        info!(%doc_id, attempt, state = %RequestState::Validated, "record validated");
                        attempts.push(AttemptRecord {
                            attempt,
                            strategy,
                            outcome: AttemptOutcome::Validated,
                            detail: format!("validated with {} coercion(s)", report.coercions.len()),
                            latency_ms,
                        });
                        return DocumentResult::Validated(ValidatedRecord {
                            record,
                            report,
                            attempts,
                        });
                    }

                    if report.has_fatal() {
                        warn!(%doc_id, attempt, state = %RequestState::Failed, "fatal validation failure");
                        attempts.push(AttemptRecord {
                            attempt,
                            strategy,
                            outcome: AttemptOutcome::Fatal,
                            detail: summarize(&report),
                            latency_ms,
                        });
                        return DocumentResult::Failed {
                            failure: PipelineFailure::NonRetryable {
                                cause: FailureCause::Validation {
                                    violations: report.violations,
                                },
                            },
                            attempts,
                        };
                    }

                    // Only arithmetic misses remain. A miss far outside
                    // tolerance means the figures themselves are wrong in
                    // the document; rereading will not fix that.
                    if !self.misses_recoverable(&report) {
                        warn!(%doc_id, attempt, state = %RequestState::Failed, "arithmetic miss beyond recoverable bound");
                        attempts.push(AttemptRecord {
                            attempt,
                            strategy,
                            outcome: AttemptOutcome::Fatal,
                            detail: summarize(&report),
                            latency_ms,
                        });
                        return DocumentResult::Failed {
                            failure: PipelineFailure::NonRetryable {
                                cause: FailureCause::Validation {
                                    violations: report.violations,
                                },
                            },
                            attempts,
                        };
                    }

                    attempts.push(AttemptRecord {
                        attempt,
                        strategy,
                        outcome: AttemptOutcome::Retryable,
                        detail: summarize(&report),
                        latency_ms,
                    });
                    escalations += 1;
                    last_cause = Some(FailureCause::Validation {
                        violations: report.violations,
                    });
                }
                Err(error) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        strategy,
                        outcome: AttemptOutcome::Retryable,
                        detail: error.to_string(),
                        latency_ms,
                    });
                    // Format trouble is the prompt's fault; escalate.
                    // Transport trouble is not; same rung next round.
                    if matches!(error, InferenceError::MalformedOutput(_)) {
                        escalations += 1;
                    }
                    warn!(%doc_id, attempt, %error, "attempt failed");
                    last_cause = Some(FailureCause::Inference { error });
                }
            }

            if attempt < self.max_attempts {
                let delay = self.backoff_delay(attempt);
                info!(%doc_id, attempt, state = %RequestState::Retrying, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return cancelled(attempts),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let cause = last_cause.unwrap_or(FailureCause::Inference {
            error: InferenceError::BackendUnavailable("no attempt produced a cause".into()),
        });
        warn!(%doc_id, attempts = self.max_attempts, state = %RequestState::Failed, "retries exhausted");
        DocumentResult::Failed {
            failure: PipelineFailure::RetriesExhausted {
                attempts: self.max_attempts,
                cause,
            },
            attempts,
        }
    }

    /// Every arithmetic miss must land within `recoverable_miss_factor`
    /// tolerances of the declared total for a retry to be worth it.
    fn misses_recoverable(&self, report: &ValidationReport) -> bool {
        report.arithmetic_misses().all(|violation| {
            match violation.kind {
                ViolationKind::ArithmeticInconsistency {
                    expected,
                    actual,
                    tolerance,
                } => (actual - expected).abs() <= self.recoverable_miss_factor * tolerance,
                _ => true,
            }
        })
    }

    /// Full-jitter exponential backoff, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let ceiling = exp.min(self.backoff_cap);
        let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

fn cancelled(attempts: Vec<AttemptRecord>) -> DocumentResult {
    DocumentResult::Failed {
        failure: PipelineFailure::Cancelled,
        attempts,
    }
}

fn summarize(report: &ValidationReport) -> String {
    match report.violations.first() {
        Some(first) => format!("{} violation(s), first: {first}", report.violations.len()),
        None => "validation failed".into(),
    }
}
