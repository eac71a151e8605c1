//! Minimal output-schema validator for staged candidates.
//!
//! The rules are deliberately small: every expected field present, no field
//! empty or null, primitive kinds match, and at least one record came back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Primitive kind an extracted field is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
}

impl FieldKind {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
        }
    }
}

/// Expected output shape for one source: field name -> primitive kind.
/// BTreeMap keeps reports deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedSchema {
    pub fields: BTreeMap<String, FieldKind>,
}

impl ExpectedSchema {
    pub fn new(fields: impl IntoIterator<Item = (String, FieldKind)>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// Result of validating sample output against an expected schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,

    /// `1 - error_count / max(field_count, 1)`, floored at zero.
    pub score: f64,

    /// True when a required field is missing entirely or zero records came
    /// back. Critical reports always reject the candidate.
    pub critical: bool,

    pub record_count: usize,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        !self.critical
    }
}

/// Validate sample records against the expected schema.
///
/// Field errors are counted per field (not per record) so the score stays in
/// proportion to the schema size.
pub fn validate_records(
    schema: &ExpectedSchema,
    records: &[serde_json::Value],
) -> ValidationReport {
    let mut errors = Vec::new();
    let mut critical = false;

    if records.is_empty() {
        errors.push("no records returned".to_string());
        critical = true;
    }

    for (field, kind) in &schema.fields {
        let mut missing = false;
        let mut empty = false;
        let mut wrong_kind = false;

        for record in records {
            match record.get(field) {
                None | Some(serde_json::Value::Null) => missing = true,
                Some(value) => {
                    if value.as_str().is_some_and(|s| s.trim().is_empty()) {
                        empty = true;
                    } else if !kind.matches(value) {
                        wrong_kind = true;
                    }
                }
            }
        }

        if missing {
            errors.push(format!("field '{field}' missing or null"));
            critical = true;
        } else if empty {
            errors.push(format!("field '{field}' empty"));
        } else if wrong_kind {
            errors.push(format!("field '{field}' has wrong type"));
        }
    }

    let field_count = schema.field_count().max(1);
    let score = (1.0 - errors.len() as f64 / field_count as f64).max(0.0);

    ValidationReport {
        errors,
        score,
        critical,
        record_count: records.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget_schema() -> ExpectedSchema {
        ExpectedSchema::new([
            ("name".to_string(), FieldKind::String),
            ("price".to_string(), FieldKind::Number),
            ("in_stock".to_string(), FieldKind::Boolean),
        ])
    }

    #[test]
    fn clean_records_pass() {
        let report = validate_records(
            &widget_schema(),
            &[json!({"name": "gizmo", "price": 9.5, "in_stock": true})],
        );
        assert!(report.passed());
        assert!(report.errors.is_empty());
        assert_eq!(report.score, 1.0);
    }

    #[test]
    fn missing_required_field_is_critical() {
        let report = validate_records(
            &widget_schema(),
            &[json!({"name": "gizmo", "in_stock": true})],
        );
        assert!(report.critical);
        assert!(!report.passed());
        assert!(report.errors.iter().any(|e| e.contains("price")));
    }

    #[test]
    fn zero_records_is_critical() {
        let report = validate_records(&widget_schema(), &[]);
        assert!(report.critical);
        assert_eq!(report.record_count, 0);
    }

    #[test]
    fn empty_string_counts_as_error_but_not_critical() {
        let report = validate_records(
            &widget_schema(),
            &[json!({"name": "  ", "price": 1, "in_stock": false})],
        );
        assert!(!report.critical);
        assert_eq!(report.errors.len(), 1);
        assert!((report.score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn type_mismatch_lowers_score() {
        let report = validate_records(
            &widget_schema(),
            &[json!({"name": "gizmo", "price": "9.50", "in_stock": true})],
        );
        assert!(!report.critical);
        assert!(report.errors.iter().any(|e| e.contains("wrong type")));
        assert!(report.score < 1.0);
    }

    #[test]
    fn empty_schema_never_divides_by_zero() {
        let report = validate_records(&ExpectedSchema::default(), &[json!({})]);
        assert!(report.passed());
        assert_eq!(report.score, 1.0);
    }
}
