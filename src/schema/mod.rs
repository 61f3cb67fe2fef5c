//! Statement schemas: field declarations, arithmetic checks, and the
//! versioned registry the pipeline resolves requests against.

pub mod definition;
pub mod registry;

pub use definition::{
    ArithmeticCheck, CheckTerm, FieldKind, FieldSpec, SchemaDefinition, SchemaVersion,
    StatementType,
};
pub use registry::SchemaRegistry;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid schema definition: {0}")]
    InvalidDefinition(String),
}
