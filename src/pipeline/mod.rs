//! The extraction pipeline.
//!
//! Flow for one request: coordinator resolves the schema and consults the
//! cache; on a miss the retry controller drives the engine through up to
//! `max_attempts` prompt rounds, validating each candidate record, and
//! the terminal result is cached and broadcast to any coalesced callers.

pub mod cache;
pub mod cancel;
pub mod coordinator;
pub mod engine;
pub mod numeric;
pub mod parser;
pub mod prompt;
pub mod retry;
pub mod strategy;
pub mod types;
pub mod validator;

pub use cache::{CacheOutcome, CacheStatus, ResultCache};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use coordinator::{BatchMetrics, BatchReport, DocumentOutcome, PipelineCoordinator};
pub use engine::ExtractionEngine;
pub use retry::RetryController;
pub use strategy::{StrategyKind, StrategyLadder};
pub use types::{
    AttemptOutcome, AttemptRecord, CandidateRecord, CoercionNote, DocumentResult,
    ExtractionRequest, FailureCause, FieldValue, PipelineFailure, Provenance, Severity,
    ValidatedRecord, ValidationReport, Violation, ViolationKind,
};
pub use validator::Validator;
