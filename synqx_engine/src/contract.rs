// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Contract Validator
//!
//! Rule-based chunk validation. [`ContractValidator::validate`] splits a
//! chunk into a valid stream and a quarantined stream; every quarantined
//! row carries a `__quarantine_reason__` field listing the identifiers of
//! all rules it failed.
//!
//! Rule identifiers follow the engine's convention: `<col>_missing` when a
//! required column is absent from the row, `<col>_rule` for any other
//! predicate failure. Reasons render as bracketed identifiers joined by a
//! space, e.g. `[age_rule] [email_rule]`.

use serde_json::Value;

use synqx_domain::{Chunk, DataContract, Row};

/// Field added to quarantined rows describing why they were diverted.
pub const QUARANTINE_REASON_FIELD: &str = "__quarantine_reason__";

/// Splits chunks into valid and quarantined streams against a
/// [`DataContract`].
pub struct ContractValidator {
    contract: DataContract,
}

impl ContractValidator {
    pub fn new(contract: DataContract) -> Self {
        Self { contract }
    }

    /// Parses a contract from its JSON representation. An empty or blank
    /// string yields an empty contract that validates everything.
    pub fn from_json(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::new(DataContract::default());
        }
        match serde_json::from_str::<DataContract>(raw) {
            Ok(contract) => Self::new(contract),
            Err(e) => {
                tracing::error!(error = %e, "failed to parse data contract, validating nothing");
                Self::new(DataContract::default())
            }
        }
    }

    /// Whether the contract escalates quarantined rows to a terminal error.
    pub fn is_strict(&self) -> bool {
        self.contract.strict
    }

    pub fn has_rules(&self) -> bool {
        !self.contract.is_empty()
    }

    /// Validates a chunk row-by-row.
    ///
    /// Returns `(valid, quarantined)`. Row order is preserved within each
    /// split and `valid.row_count() + quarantined.row_count()` always equals
    /// the input row count. Empty input or an empty contract yields the
    /// input unchanged with an empty quarantine.
    pub fn validate(&self, chunk: &Chunk) -> (Chunk, Chunk) {
        if chunk.is_empty() || self.contract.is_empty() {
            return (chunk.clone(), Chunk::empty());
        }

        let mut valid_rows: Vec<Row> = Vec::with_capacity(chunk.row_count());
        let mut quarantined_rows: Vec<Row> = Vec::new();

        for row in chunk.rows() {
            let failures = self.failed_rules(row);
            if failures.is_empty() {
                valid_rows.push(row.clone());
            } else {
                let mut tagged = row.clone();
                let reason = failures
                    .iter()
                    .map(|id| format!("[{}]", id))
                    .collect::<Vec<_>>()
                    .join(" ");
                tagged.insert(QUARANTINE_REASON_FIELD.to_string(), Value::String(reason));
                quarantined_rows.push(tagged);
            }
        }

        (Chunk::new(valid_rows), Chunk::new(quarantined_rows))
    }

    /// Identifiers of every rule `row` fails.
    fn failed_rules(&self, row: &Row) -> Vec<String> {
        let mut failures = Vec::new();
        for rule in &self.contract.columns {
            if rule.name.is_empty() {
                continue;
            }
            match row.get(&rule.name) {
                None => {
                    if rule.required {
                        failures.push(format!("{}_missing", rule.name));
                    }
                }
                Some(value) => {
                    if !rule.value_passes(value) {
                        failures.push(format!("{}_rule", rule.name));
                    }
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use synqx_domain::{row, ColumnRule, ValueKind};

    fn age_contract() -> DataContract {
        DataContract {
            columns: vec![ColumnRule {
                name: "age".into(),
                value_kind: Some(ValueKind::Integer),
                min: Some(json!(0)),
                ..Default::default()
            }],
            strict: false,
        }
    }

    #[test]
    fn test_quarantine_split_matches_spec_scenario() {
        // Rule {name: 'age', type: integer, min: 0} against
        // [{age:5},{age:-1},{age:'bad'}]
        let validator = ContractValidator::new(age_contract());
        let chunk = Chunk::new(vec![
            row(&[("age", json!(5))]),
            row(&[("age", json!(-1))]),
            row(&[("age", json!("bad"))]),
        ]);

        let (valid, quarantined) = validator.validate(&chunk);
        assert_eq!(valid.row_count(), 1);
        assert_eq!(valid.rows()[0].get("age"), Some(&json!(5)));
        assert_eq!(quarantined.row_count(), 2);
        for row in quarantined.rows() {
            let reason = row.get(QUARANTINE_REASON_FIELD).and_then(Value::as_str).unwrap();
            assert!(reason.contains("age_rule"), "reason was {:?}", reason);
        }
    }

    #[test]
    fn test_row_conservation() {
        let validator = ContractValidator::new(age_contract());
        let chunk = Chunk::new(
            (0..50)
                .map(|i| row(&[("age", json!(i as i64 - 25))]))
                .collect(),
        );
        let (valid, quarantined) = validator.validate(&chunk);
        assert_eq!(valid.row_count() + quarantined.row_count(), chunk.row_count());
    }

    #[test]
    fn test_missing_required_column() {
        let contract = DataContract {
            columns: vec![ColumnRule {
                name: "email".into(),
                required: true,
                ..Default::default()
            }],
            strict: false,
        };
        let validator = ContractValidator::new(contract);
        let chunk = Chunk::new(vec![row(&[("name", json!("sam"))])]);
        let (valid, quarantined) = validator.validate(&chunk);
        assert!(valid.is_empty());
        let reason = quarantined.rows()[0]
            .get(QUARANTINE_REASON_FIELD)
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(reason, "[email_missing]");
    }

    #[test]
    fn test_multiple_failed_rules_all_listed() {
        let contract = DataContract {
            columns: vec![
                ColumnRule {
                    name: "age".into(),
                    min: Some(json!(0)),
                    ..Default::default()
                },
                ColumnRule {
                    name: "code".into(),
                    pattern: Some("^[A-Z]+$".into()),
                    ..Default::default()
                },
            ],
            strict: false,
        };
        let validator = ContractValidator::new(contract);
        let chunk = Chunk::new(vec![row(&[("age", json!(-3)), ("code", json!("bad"))])]);
        let (_, quarantined) = validator.validate(&chunk);
        let reason = quarantined.rows()[0]
            .get(QUARANTINE_REASON_FIELD)
            .and_then(Value::as_str)
            .unwrap();
        assert!(reason.contains("[age_rule]"));
        assert!(reason.contains("[code_rule]"));
    }

    #[test]
    fn test_empty_input_yields_empty_splits() {
        let validator = ContractValidator::new(age_contract());
        let (valid, quarantined) = validator.validate(&Chunk::empty());
        assert!(valid.is_empty());
        assert!(quarantined.is_empty());
    }

    #[test]
    fn test_empty_contract_passes_everything() {
        let validator = ContractValidator::from_json("");
        let chunk = Chunk::new(vec![row(&[("anything", json!("goes"))])]);
        let (valid, quarantined) = validator.validate(&chunk);
        assert_eq!(valid.row_count(), 1);
        assert!(quarantined.is_empty());
    }
}
