//! Shared pipeline data types: requests, extracted records, validation
//! reports, attempt trails, and terminal failures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::InferenceError;
use crate::document::{Document, Fingerprint};
use crate::schema::{FieldKind, SchemaVersion, StatementType};

use super::strategy::StrategyKind;

// ═══════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════

/// One unit of work: extract one statement type from one document.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub document: Arc<Document>,
    pub statement: StatementType,
    pub schema_version: SchemaVersion,
    /// Bypass any cached result and recompute. Not part of the request
    /// identity: the fresh result overwrites the cached one.
    pub force_refresh: bool,
}

impl ExtractionRequest {
    pub fn new(
        document: Arc<Document>,
        statement: StatementType,
        schema_version: SchemaVersion,
    ) -> Self {
        Self {
            document,
            statement,
            schema_version,
            force_refresh: false,
        }
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    /// Cache identity: document content, statement, schema version, and
    /// the strategy ladder in force. `force_refresh` is deliberately
    /// excluded.
    pub fn fingerprint(&self, ladder_id: &str) -> Fingerprint {
        Fingerprint::of_parts(&[
            self.document.fingerprint().as_bytes(),
            self.statement.as_key().as_bytes(),
            &self.schema_version.0.to_le_bytes(),
            ladder_id.as_bytes(),
        ])
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Extracted records
// ═══════════════════════════════════════════════════════════════════════════

/// A single extracted field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Number(_) => FieldKind::Numeric,
            Self::Date(_) => FieldKind::Date,
            Self::Text(_) => FieldKind::Text,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Where and how a record was produced.
#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub strategy: StrategyKind,
    pub attempt: u32,
    pub extracted_at: DateTime<Utc>,
}

/// Raw engine output mapped onto schema fields, before validation.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub fields: BTreeMap<String, FieldValue>,
    pub provenance: Provenance,
}

impl CandidateRecord {
    pub fn numeric(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(FieldValue::as_number)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Another extraction attempt cannot fix this record.
    Fatal,
    /// Worth retrying; the model may produce a consistent record next time.
    Recoverable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    MissingField,
    TypeMismatch {
        expected: FieldKind,
    },
    ArithmeticInconsistency {
        expected: f64,
        actual: f64,
        tolerance: f64,
    },
}

/// One failed schema rule. `subject` is the field name for field-level
/// violations, the check name for arithmetic ones.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub subject: String,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl Violation {
    pub fn severity(&self) -> Severity {
        match self.kind {
            ViolationKind::MissingField | ViolationKind::TypeMismatch { .. } => Severity::Fatal,
            ViolationKind::ArithmeticInconsistency { .. } => Severity::Recoverable,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::MissingField => write!(f, "{}: required field missing", self.subject),
            ViolationKind::TypeMismatch { expected } => {
                write!(f, "{}: expected a {expected} value", self.subject)
            }
            ViolationKind::ArithmeticInconsistency {
                expected,
                actual,
                tolerance,
            } => write!(
                f,
                "{}: declared {actual} but components give {expected} (tolerance {tolerance})",
                self.subject
            ),
        }
    }
}

/// A lenient parse the validator accepted, kept for audit.
#[derive(Debug, Clone, Serialize)]
pub struct CoercionNote {
    pub field: String,
    pub raw: String,
    pub coerced: FieldValue,
}

/// Outcome of validating one candidate record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
    pub coercions: Vec<CoercionNote>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn has_fatal(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.severity() == Severity::Fatal)
    }

    pub fn arithmetic_misses(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| matches!(v.kind, ViolationKind::ArithmeticInconsistency { .. }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Attempt trail and terminal results
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Validated,
    Retryable,
    Fatal,
}

/// Audit entry for one engine invocation.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub strategy: StrategyKind,
    pub outcome: AttemptOutcome,
    pub detail: String,
    pub latency_ms: u64,
}

/// Lifecycle of a request inside the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    InFlight,
    Retrying,
    Validated,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Retrying => "retrying",
            Self::Validated => "validated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a request ultimately failed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    Inference { error: InferenceError },
    Validation { violations: Vec<Violation> },
    SchemaUnavailable { statement: String, version: SchemaVersion },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inference { error } => write!(f, "inference failed: {error}"),
            Self::Validation { violations } => match violations.first() {
                Some(first) => write!(f, "{} violation(s), first: {first}", violations.len()),
                None => f.write_str("validation failed"),
            },
            Self::SchemaUnavailable { statement, version } => {
                write!(f, "no schema registered for {statement} {version}")
            }
        }
    }
}

/// Terminal, non-retryable outcome of a request.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum PipelineFailure {
    #[error("gave up after {attempts} attempt(s): {cause}")]
    RetriesExhausted { attempts: u32, cause: FailureCause },

    #[error("not retryable: {cause}")]
    NonRetryable { cause: FailureCause },

    #[error("request was cancelled")]
    Cancelled,
}

/// Record that survived validation, with its full audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedRecord {
    pub record: CandidateRecord,
    pub report: ValidationReport,
    pub attempts: Vec<AttemptRecord>,
}

/// Final result for one request. Both arms carry the attempt trail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentResult {
    Validated(ValidatedRecord),
    Failed {
        failure: PipelineFailure,
        attempts: Vec<AttemptRecord>,
    },
}

impl DocumentResult {
    pub fn is_validated(&self) -> bool {
        matches!(self, Self::Validated(_))
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Validated(v) => &v.attempts,
            Self::Failed { attempts, .. } => attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> ExtractionRequest {
        ExtractionRequest::new(
            Arc::new(Document::from_text(text)),
            StatementType::BalanceSheet,
            SchemaVersion(1),
        )
    }

    #[test]
    fn fingerprint_ignores_force_refresh() {
        let a = request("Total assets: 500");
        let b = request("Total assets: 500").force_refresh();
        assert_eq!(a.fingerprint("standard"), b.fingerprint("standard"));
    }

    #[test]
    fn fingerprint_varies_by_statement_and_version() {
        let doc = Arc::new(Document::from_text("Total assets: 500"));
        let a = ExtractionRequest::new(doc.clone(), StatementType::BalanceSheet, SchemaVersion(1));
        let b = ExtractionRequest::new(doc.clone(), StatementType::IncomeStatement, SchemaVersion(1));
        let c = ExtractionRequest::new(doc, StatementType::BalanceSheet, SchemaVersion(2));
        assert_ne!(a.fingerprint("x"), b.fingerprint("x"));
        assert_ne!(a.fingerprint("x"), c.fingerprint("x"));
        assert_ne!(a.fingerprint("x"), a.fingerprint("y"));
    }

    #[test]
    fn field_value_deserializes_untagged() {
        let n: FieldValue = serde_json::from_str("1250.75").unwrap();
        assert_eq!(n, FieldValue::Number(1250.75));

        let d: FieldValue = serde_json::from_str("\"2024-12-31\"").unwrap();
        assert_eq!(
            d,
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap())
        );

        let t: FieldValue = serde_json::from_str("\"Acme Holdings\"").unwrap();
        assert_eq!(t, FieldValue::Text("Acme Holdings".into()));
    }

    #[test]
    fn severity_follows_violation_kind() {
        let missing = Violation {
            subject: "total_assets".into(),
            kind: ViolationKind::MissingField,
        };
        let miss = Violation {
            subject: "balance_equation".into(),
            kind: ViolationKind::ArithmeticInconsistency {
                expected: 100.0,
                actual: 101.0,
                tolerance: 0.5,
            },
        };
        assert_eq!(missing.severity(), Severity::Fatal);
        assert_eq!(miss.severity(), Severity::Recoverable);
    }

    #[test]
    fn report_helpers() {
        let mut report = ValidationReport::default();
        assert!(report.passed());
        report.violations.push(Violation {
            subject: "balance_equation".into(),
            kind: ViolationKind::ArithmeticInconsistency {
                expected: 100.0,
                actual: 150.0,
                tolerance: 0.5,
            },
        });
        assert!(!report.passed());
        assert!(!report.has_fatal());
        assert_eq!(report.arithmetic_misses().count(), 1);
    }
}
