//! LedgerLens: structured financial-statement extraction.
//!
//! Takes canonicalized document text, prompts a local LLM backend for the
//! figures a statement schema declares, validates arithmetic consistency
//! deterministically, retries with escalating prompt strictness, and
//! deduplicates work through a fingerprint-keyed result cache.

pub mod backend;
pub mod config;
pub mod document;
pub mod pipeline;
pub mod schema;

pub use config::{ConfigError, CoreConfig};
pub use document::{Document, Fingerprint};
pub use pipeline::{BatchReport, ExtractionRequest, PipelineCoordinator};
pub use schema::{SchemaRegistry, SchemaVersion, StatementType};
