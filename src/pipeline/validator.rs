//! Deterministic schema validation.
//!
//! Validation never talks to the model: given the same record, schema,
//! and tolerances it always produces the same report. Field checks run
//! in schema declaration order, then arithmetic checks; an unambiguous
//! lenient parse (formatted amount, recognizable date string) is accepted
//! and recorded as a coercion note rather than rejected.

use chrono::NaiveDate;

use crate::config::CoreConfig;
use crate::schema::{FieldKind, SchemaDefinition};

use super::numeric::coerce_numeric;
use super::types::{
    CandidateRecord, CoercionNote, FieldValue, ValidationReport, Violation, ViolationKind,
};

/// Date layouts we accept besides ISO. Anything else is a mismatch.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d %B %Y", "%B %d, %Y"];

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    rel_tolerance: f64,
    abs_tolerance: f64,
}

impl Validator {
    pub fn new(rel_tolerance: f64, abs_tolerance: f64) -> Self {
        Self {
            rel_tolerance,
            abs_tolerance,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.rel_tolerance, config.abs_tolerance)
    }

    /// Tolerance for one check: relative to the declared total's
    /// magnitude, floored by the absolute tolerance so near-zero totals
    /// do not demand exact arithmetic.
    pub fn tolerance_for(&self, declared_total: f64) -> f64 {
        (self.rel_tolerance * declared_total.abs()).max(self.abs_tolerance)
    }

    /// Check a candidate record against its schema. Returns the record
    /// with accepted coercions applied, plus the report.
    pub fn validate(
        &self,
        mut record: CandidateRecord,
        schema: &SchemaDefinition,
    ) -> (CandidateRecord, ValidationReport) {
        let mut report = ValidationReport::default();

        for spec in &schema.fields {
            match record.fields.get(&spec.name) {
                None => {
                    if spec.required {
                        report.violations.push(Violation {
                            subject: spec.name.clone(),
                            kind: ViolationKind::MissingField,
                        });
                    }
                }
                Some(value) => {
                    if let Some(resolution) = resolve_kind(&spec.name, value, spec.kind) {
                        match resolution {
                            Resolution::Coerced(note) => {
                                record
                                    .fields
                                    .insert(spec.name.clone(), note.coerced.clone());
                                report.coercions.push(note);
                            }
                            Resolution::Mismatch => {
                                report.violations.push(Violation {
                                    subject: spec.name.clone(),
                                    kind: ViolationKind::TypeMismatch {
                                        expected: spec.kind,
                                    },
                                });
                            }
                        }
                    }
                }
            }
        }

        for check in &schema.checks {
            let Some(actual) = record.numeric(&check.total) else {
                continue;
            };
            let mut expected = 0.0;
            let mut complete = true;
            for term in &check.components {
                match record.numeric(&term.field) {
                    Some(value) => expected += term.weight * value,
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            // A check only fires when every involved field is present;
            // absent fields are the field checks' concern.
            if !complete {
                continue;
            }
            let tolerance = self.tolerance_for(actual);
            if (expected - actual).abs() > tolerance {
                report.violations.push(Violation {
                    subject: check.name.clone(),
                    kind: ViolationKind::ArithmeticInconsistency {
                        expected,
                        actual,
                        tolerance,
                    },
                });
            }
        }

        (record, report)
    }
}

enum Resolution {
    Coerced(CoercionNote),
    Mismatch,
}

/// `None` means the value already has the expected kind.
fn resolve_kind(field: &str, value: &FieldValue, expected: FieldKind) -> Option<Resolution> {
    if value.kind() == expected {
        return None;
    }

    let coerced = match (expected, value) {
        (FieldKind::Numeric, FieldValue::Text(raw)) => {
            coerce_numeric(raw).map(|n| (raw.clone(), FieldValue::Number(n)))
        }
        (FieldKind::Date, FieldValue::Text(raw)) => {
            parse_lenient_date(raw).map(|d| (raw.clone(), FieldValue::Date(d)))
        }
        // The parser may have eagerly read an ISO string as a date.
        (FieldKind::Text, FieldValue::Date(date)) => {
            Some((date.to_string(), FieldValue::Text(date.to_string())))
        }
        _ => None,
    };

    Some(match coerced {
        Some((raw, value)) => Resolution::Coerced(CoercionNote {
            field: field.to_string(),
            raw,
            coerced: value,
        }),
        None => Resolution::Mismatch,
    })
}

fn parse_lenient_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}
