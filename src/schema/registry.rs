//! Versioned, immutable schema lookup.
//!
//! The registry is built once at startup from the built-in statement
//! definitions plus any JSON-defined supporting schedules, then shared
//! read-only across the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use super::definition::{
    ArithmeticCheck, FieldKind, FieldSpec, SchemaDefinition, SchemaVersion, StatementType,
};
use super::SchemaError;

/// Read-only map of (statement, version) to definition.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<(StatementType, SchemaVersion), Arc<SchemaDefinition>>,
}

impl SchemaRegistry {
    /// Empty registry. Mostly useful in tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in statement definitions.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(balance_sheet_v1());
        registry.insert(income_statement_v1());
        registry.insert(cash_flow_statement_v1());
        registry
    }

    /// Add one definition. Later inserts for the same (statement, version)
    /// replace earlier ones; callers do this only during startup.
    pub fn insert(&mut self, schema: SchemaDefinition) {
        self.schemas.insert(
            (schema.statement.clone(), schema.version),
            Arc::new(schema),
        );
    }

    /// Load extra definitions from a JSON array (supporting schedules).
    pub fn load_json(&mut self, json: &str) -> Result<usize, SchemaError> {
        let schemas: Vec<SchemaDefinition> =
            serde_json::from_str(json).map_err(|e| SchemaError::InvalidDefinition(e.to_string()))?;
        let count = schemas.len();
        for schema in schemas {
            if schema.fields.is_empty() {
                return Err(SchemaError::InvalidDefinition(format!(
                    "schema {} {} declares no fields",
                    schema.statement, schema.version
                )));
            }
            self.insert(schema);
        }
        Ok(count)
    }

    pub fn get(
        &self,
        statement: &StatementType,
        version: SchemaVersion,
    ) -> Option<Arc<SchemaDefinition>> {
        self.schemas.get(&(statement.clone(), version)).cloned()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn balance_sheet_v1() -> SchemaDefinition {
    SchemaDefinition {
        statement: StatementType::BalanceSheet,
        version: SchemaVersion(1),
        fields: vec![
            FieldSpec::optional("entity_name", FieldKind::Text),
            FieldSpec::optional("statement_date", FieldKind::Date),
            FieldSpec::required("total_assets", FieldKind::Numeric),
            FieldSpec::optional("current_assets", FieldKind::Numeric),
            FieldSpec::optional("non_current_assets", FieldKind::Numeric),
            FieldSpec::required("total_liabilities", FieldKind::Numeric),
            FieldSpec::optional("current_liabilities", FieldKind::Numeric),
            FieldSpec::optional("non_current_liabilities", FieldKind::Numeric),
            FieldSpec::required("total_equity", FieldKind::Numeric),
        ],
        checks: vec![
            ArithmeticCheck::sum(
                "balance_equation",
                "total_assets",
                &["total_liabilities", "total_equity"],
            ),
            ArithmeticCheck::sum(
                "asset_composition",
                "total_assets",
                &["current_assets", "non_current_assets"],
            ),
            ArithmeticCheck::sum(
                "liability_composition",
                "total_liabilities",
                &["current_liabilities", "non_current_liabilities"],
            ),
        ],
    }
}

fn income_statement_v1() -> SchemaDefinition {
    SchemaDefinition {
        statement: StatementType::IncomeStatement,
        version: SchemaVersion(1),
        fields: vec![
            FieldSpec::optional("entity_name", FieldKind::Text),
            FieldSpec::optional("period_end", FieldKind::Date),
            FieldSpec::required("revenue", FieldKind::Numeric),
            FieldSpec::required("cost_of_sales", FieldKind::Numeric),
            FieldSpec::required("gross_profit", FieldKind::Numeric),
            FieldSpec::optional("operating_expenses", FieldKind::Numeric),
            FieldSpec::optional("operating_income", FieldKind::Numeric),
            FieldSpec::required("net_income", FieldKind::Numeric),
        ],
        checks: vec![
            ArithmeticCheck::difference("gross_profit_equation", "gross_profit", "revenue", "cost_of_sales"),
            ArithmeticCheck::difference(
                "operating_income_equation",
                "operating_income",
                "gross_profit",
                "operating_expenses",
            ),
        ],
    }
}

fn cash_flow_statement_v1() -> SchemaDefinition {
    SchemaDefinition {
        statement: StatementType::CashFlowStatement,
        version: SchemaVersion(1),
        fields: vec![
            FieldSpec::optional("entity_name", FieldKind::Text),
            FieldSpec::optional("period_end", FieldKind::Date),
            FieldSpec::required("operating_cash_flow", FieldKind::Numeric),
            FieldSpec::required("investing_cash_flow", FieldKind::Numeric),
            FieldSpec::required("financing_cash_flow", FieldKind::Numeric),
            FieldSpec::required("net_change_in_cash", FieldKind::Numeric),
            FieldSpec::optional("opening_cash", FieldKind::Numeric),
            FieldSpec::optional("closing_cash", FieldKind::Numeric),
        ],
        checks: vec![
            ArithmeticCheck::sum(
                "net_change_equation",
                "net_change_in_cash",
                &[
                    "operating_cash_flow",
                    "investing_cash_flow",
                    "financing_cash_flow",
                ],
            ),
            ArithmeticCheck::sum(
                "cash_reconciliation",
                "closing_cash",
                &["opening_cash", "net_change_in_cash"],
            ),
        ],
    }
}
