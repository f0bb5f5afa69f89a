// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Data Contract Value Objects
//!
//! Declarative rule shapes attached to pipeline nodes. A [`DataContract`]
//! names columns and the predicates each must satisfy; the engine's contract
//! validator interprets these rules row-by-row and splits chunks into valid
//! and quarantined streams.
//!
//! Type predicates test **coercibility**, not instance type: `"42"` passes
//! an `integer` rule, `"bad"` does not. Null values pass type predicates
//! (nullability is governed by `required`/`not_null`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value_objects::WatermarkValue;

/// Expected value kind for a contract `type` predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Integer,
    Float,
    Boolean,
    Datetime,
    String,
}

impl ValueKind {
    /// Whether `value` is coercible to this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            // Nullability is the concern of required/not_null, not type
            return true;
        }
        match self {
            ValueKind::Integer => match value {
                Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
                Value::String(s) => s.trim().parse::<i64>().is_ok(),
                _ => false,
            },
            ValueKind::Float => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            ValueKind::Boolean => match value {
                Value::Bool(_) => true,
                Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "false" | "0" | "1"),
                Value::Number(n) => matches!(n.as_i64(), Some(0) | Some(1)),
                _ => false,
            },
            ValueKind::Datetime => match value {
                Value::String(s) => {
                    chrono::DateTime::parse_from_rfc3339(s.trim()).is_ok()
                        || chrono::NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S").is_ok()
                        || chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok()
                }
                _ => false,
            },
            ValueKind::String => value.is_string(),
        }
    }
}

/// Predicates declared for one column.
///
/// `name` accepts the legacy alias `column`. Every predicate is optional;
/// a rule with no predicates never fails.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ColumnRule {
    #[serde(alias = "column")]
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_kind: Option<ValueKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

impl ColumnRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether a single non-missing value satisfies every predicate of this
    /// rule. Missing-column handling lives in the validator, which sees the
    /// whole row.
    pub fn value_passes(&self, value: &Value) -> bool {
        if (self.required || self.not_null) && value.is_null() {
            return false;
        }
        if let Some(kind) = self.value_kind {
            if !kind.accepts(value) {
                return false;
            }
        }
        if value.is_null() {
            // Remaining predicates only constrain present values
            return true;
        }
        if let Some(min) = &self.min {
            let bound = WatermarkValue::new(min.clone());
            if WatermarkValue::new(value.clone()).compare(&bound) == std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(max) = &self.max {
            let bound = WatermarkValue::new(max.clone());
            if WatermarkValue::new(value.clone()).compare(&bound) == std::cmp::Ordering::Greater {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(&text) {
                        return false;
                    }
                }
                // An unparseable pattern fails the rule rather than silently passing
                Err(_) => return false,
            }
        }
        if let Some(allowed) = &self.values {
            if !allowed.contains(value) {
                return false;
            }
        }
        true
    }
}

/// A node-level data contract: per-column rules plus the strictness flag.
///
/// When `strict` is set, any quarantined row escalates from a divergent
/// stream to a terminal `ContractViolation` for the node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataContract {
    #[serde(default)]
    pub columns: Vec<ColumnRule>,
    #[serde(default)]
    pub strict: bool,
}

impl DataContract {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_coercibility() {
        let kind = ValueKind::Integer;
        assert!(kind.accepts(&json!(5)));
        assert!(kind.accepts(&json!("42")));
        assert!(kind.accepts(&json!(null)));
        assert!(!kind.accepts(&json!("bad")));
        assert!(!kind.accepts(&json!(3.5)));
    }

    #[test]
    fn test_datetime_coercibility() {
        let kind = ValueKind::Datetime;
        assert!(kind.accepts(&json!("2024-01-01")));
        assert!(kind.accepts(&json!("2024-01-01T10:00:00Z")));
        assert!(!kind.accepts(&json!("not a date")));
    }

    #[test]
    fn test_rule_min_max() {
        let rule = ColumnRule {
            name: "age".into(),
            min: Some(json!(0)),
            max: Some(json!(120)),
            ..Default::default()
        };
        assert!(rule.value_passes(&json!(30)));
        assert!(!rule.value_passes(&json!(-1)));
        assert!(!rule.value_passes(&json!(121)));
    }

    #[test]
    fn test_rule_pattern_and_values() {
        let rule = ColumnRule {
            name: "code".into(),
            pattern: Some("^[A-Z]{3}$".into()),
            ..Default::default()
        };
        assert!(rule.value_passes(&json!("ABC")));
        assert!(!rule.value_passes(&json!("abc")));

        let rule = ColumnRule {
            name: "status".into(),
            values: Some(vec![json!("open"), json!("closed")]),
            ..Default::default()
        };
        assert!(rule.value_passes(&json!("open")));
        assert!(!rule.value_passes(&json!("pending")));
    }

    #[test]
    fn test_required_rejects_null() {
        let rule = ColumnRule {
            name: "id".into(),
            required: true,
            ..Default::default()
        };
        assert!(!rule.value_passes(&json!(null)));
        assert!(rule.value_passes(&json!(1)));
    }

    #[test]
    fn test_contract_deserializes_column_alias() {
        let contract: DataContract =
            serde_json::from_value(json!({"columns": [{"column": "age", "type": "integer", "min": 0}]})).unwrap();
        assert_eq!(contract.columns[0].name, "age");
        assert_eq!(contract.columns[0].value_kind, Some(ValueKind::Integer));
    }
}
