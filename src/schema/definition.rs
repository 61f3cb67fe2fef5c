//! Statement schema definitions.
//!
//! A schema names the fields a statement type carries, their expected
//! value kinds, and the arithmetic relationships that must hold between
//! numeric fields (e.g. assets = liabilities + equity). Definitions are
//! plain serde data so supporting schedules can be loaded from JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which financial statement a schema (and a request) refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    BalanceSheet,
    IncomeStatement,
    CashFlowStatement,
    /// Arbitrary supporting schedule, identified by name.
    Schedule(String),
}

impl StatementType {
    /// Stable key used in fingerprints and registry lookups.
    pub fn as_key(&self) -> String {
        match self {
            Self::BalanceSheet => "balance_sheet".into(),
            Self::IncomeStatement => "income_statement".into(),
            Self::CashFlowStatement => "cash_flow_statement".into(),
            Self::Schedule(name) => format!("schedule:{name}"),
        }
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

impl FromStr for StatementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balance_sheet" => Ok(Self::BalanceSheet),
            "income_statement" => Ok(Self::IncomeStatement),
            "cash_flow_statement" => Ok(Self::CashFlowStatement),
            other => match other.strip_prefix("schedule:") {
                Some(name) if !name.is_empty() => Ok(Self::Schedule(name.to_string())),
                _ => Err(format!(
                    "unknown statement type '{other}' (expected balance_sheet, \
                     income_statement, cash_flow_statement, or schedule:<name>)"
                )),
            },
        }
    }
}

/// Monotonically increasing schema version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SchemaVersion(pub u32);

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Expected value kind for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Numeric,
    Text,
    Date,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric => f.write_str("numeric"),
            Self::Text => f.write_str("text"),
            Self::Date => f.write_str("date"),
        }
    }
}

/// One declared field of a statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// One weighted term of an arithmetic check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTerm {
    pub field: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Declared relationship: `total` must equal the weighted sum of
/// `components`, within the configured tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArithmeticCheck {
    /// Stable name used in violation reports (e.g. "balance_equation").
    pub name: String,
    pub total: String,
    pub components: Vec<CheckTerm>,
}

impl ArithmeticCheck {
    pub fn sum(name: &str, total: &str, components: &[&str]) -> Self {
        Self {
            name: name.into(),
            total: total.into(),
            components: components
                .iter()
                .map(|field| CheckTerm {
                    field: (*field).into(),
                    weight: 1.0,
                })
                .collect(),
        }
    }

    pub fn difference(name: &str, total: &str, plus: &str, minus: &str) -> Self {
        Self {
            name: name.into(),
            total: total.into(),
            components: vec![
                CheckTerm {
                    field: plus.into(),
                    weight: 1.0,
                },
                CheckTerm {
                    field: minus.into(),
                    weight: -1.0,
                },
            ],
        }
    }
}

/// Complete structural definition for one (statement, version) pair.
/// Immutable at runtime; the registry hands out shared references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub statement: StatementType,
    pub version: SchemaVersion,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub checks: Vec<ArithmeticCheck>,
}

impl SchemaDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }
}
