//! Prompt construction for statement extraction.
//!
//! Each strategy tier renders the same schema differently: the standard
//! tier describes fields, strict format adds hard output rules and a
//! worked example, reduced schema asks only for required fields.

use crate::backend::PromptContext;
use crate::schema::{FieldKind, FieldSpec, SchemaDefinition};

use super::strategy::StrategyKind;

pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are a financial document extraction assistant. Your ONLY role is to read
raw financial statement text and report the figures it explicitly states.

RULES - ABSOLUTE, NO EXCEPTIONS:
1. Extract ONLY values explicitly stated in the document.
2. NEVER compute, estimate, or infer a figure that is not written.
3. If a field is unclear or missing, output null for that field.
4. Report amounts as plain JSON numbers without currency symbols or
   thousands separators.
5. Report dates as YYYY-MM-DD.
6. Output MUST be a single valid JSON object wrapped in ```json``` fences.
"#;

const STRICT_FORMAT_RULES: &str = r#"
OUTPUT FORMAT - STRICT:
- Respond with EXACTLY one ```json``` fenced block and nothing else.
- No commentary before or after the block.
- Every key from the template must appear, with a number, a "YYYY-MM-DD"
  string, a plain string, or null as its value.
- Example of a correct response shape:
```json
{"total_assets": 1500000.00, "statement_date": "2024-12-31", "entity_name": null}
```
"#;

/// Render the full prompt pair for one attempt.
pub fn build_prompt(
    schema: &SchemaDefinition,
    strategy: StrategyKind,
    document_text: &str,
) -> PromptContext {
    let fields: Vec<&FieldSpec> = match strategy {
        StrategyKind::ReducedSchema => schema.required_fields().collect(),
        _ => schema.fields.iter().collect(),
    };

    let template = json_template(&fields);
    let field_notes = field_notes(&fields);

    let strict_rules = match strategy {
        StrategyKind::StrictFormat | StrategyKind::ReducedSchema => STRICT_FORMAT_RULES,
        StrategyKind::Standard => "",
    };

    let reduced_note = match strategy {
        StrategyKind::ReducedSchema => {
            "Report ONLY the fields listed below. Ignore everything else in the document.\n"
        }
        _ => "",
    };

    let user = format!(
        r#"<document>
{document_text}
</document>

Extract the {statement} figures from the above document into the following
JSON structure. For any field not present in the document, use null.
{reduced_note}
```json
{template}
```

Field notes:
{field_notes}
{strict_rules}"#,
        statement = schema.statement,
    );

    PromptContext {
        system: EXTRACTION_SYSTEM_PROMPT.to_string(),
        user,
    }
}

fn json_template(fields: &[&FieldSpec]) -> String {
    let mut lines = Vec::with_capacity(fields.len());
    for field in fields {
        let placeholder = match field.kind {
            FieldKind::Numeric => "0.0",
            FieldKind::Date => "\"YYYY-MM-DD or null\"",
            FieldKind::Text => "\"text or null\"",
        };
        lines.push(format!("  \"{}\": {placeholder}", field.name));
    }
    format!("{{\n{}\n}}", lines.join(",\n"))
}

fn field_notes(fields: &[&FieldSpec]) -> String {
    fields
        .iter()
        .map(|field| {
            let requirement = if field.required {
                "required"
            } else {
                "null if absent"
            };
            format!("- {}: {} ({requirement})", field.name, field.kind)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
