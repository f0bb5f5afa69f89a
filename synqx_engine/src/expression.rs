// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Expression Evaluator
//!
//! A minimal, safe evaluator for the two dynamic-config surfaces of a
//! pipeline: edge conditions and dynamic-mapping expressions. It is
//! deliberately not a general interpreter; exactly three forms are
//! recognized:
//!
//! 1. literal JSON list: `[1, 2, 3]` or `[{"region": "eu"}, …]`
//! 2. `inputs['<node>'].count <cmp> <literal>` with `<cmp>` one of
//!    `>`, `>=`, `<`, `<=`, `==`, `!=`
//! 3. `inputs['<node>'].rows`, producing the upstream row sequence
//!
//! Anything else returns `SynqxError::Expression`. Whether an evaluation
//! failure is fatal is the caller's policy; the runner fails closed by
//! default.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use synqx_domain::{Chunk, SynqxError};

/// Read access to upstream outputs during evaluation. Implemented by the
/// data cache; tests use closures over fixed maps.
pub trait InputLookup {
    /// Chunks produced by `node_id`, empty when absent.
    fn chunks(&self, node_id: &str) -> Vec<Chunk>;
}

impl<F> InputLookup for F
where
    F: Fn(&str) -> Vec<Chunk>,
{
    fn chunks(&self, node_id: &str) -> Vec<Chunk> {
        self(node_id)
    }
}

fn count_expr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^inputs\['([^']+)'\]\.count\s*(>=|<=|==|!=|>|<)\s*(-?\d+(?:\.\d+)?)$")
            .expect("count expression regex is valid")
    })
}

fn rows_expr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^inputs\['([^']+)'\]\.rows$").expect("rows expression regex is valid"))
}

/// Evaluates an edge condition to a boolean.
///
/// Only the `inputs['<node>'].count <cmp> <literal>` form is a valid
/// condition; the row count is the total across the upstream's chunks.
///
/// # Errors
/// `SynqxError::Expression` for any unrecognized form.
pub fn evaluate_condition(condition: &str, inputs: &dyn InputLookup) -> Result<bool, SynqxError> {
    let condition = condition.trim();
    let captures = count_expr_regex()
        .captures(condition)
        .ok_or_else(|| SynqxError::Expression(format!("Unsupported condition expression: '{}'", condition)))?;

    let node_id = &captures[1];
    let comparator = &captures[2];
    let literal: f64 = captures[3]
        .parse()
        .map_err(|_| SynqxError::Expression(format!("Invalid numeric literal in condition: '{}'", condition)))?;

    let count: usize = inputs.chunks(node_id).iter().map(Chunk::row_count).sum();
    let count = count as f64;

    Ok(match comparator {
        ">" => count > literal,
        ">=" => count >= literal,
        "<" => count < literal,
        "<=" => count <= literal,
        "==" => count == literal,
        "!=" => count != literal,
        _ => unreachable!("regex restricts comparators"),
    })
}

/// Evaluates a dynamic-mapping expression to the list of fan-out items.
///
/// Literal lists produce their elements; `inputs['<node>'].rows` produces
/// one item per upstream row (as a JSON object).
///
/// # Errors
/// `SynqxError::Expression` for any unrecognized form or a literal that is
/// not a JSON array.
pub fn evaluate_mapping(expr: &str, inputs: &dyn InputLookup) -> Result<Vec<Value>, SynqxError> {
    let expr = expr.trim();

    if expr.starts_with('[') {
        let value: Value = serde_json::from_str(expr)
            .map_err(|e| SynqxError::Expression(format!("Invalid literal list '{}': {}", expr, e)))?;
        return match value {
            Value::Array(items) => Ok(items),
            _ => Err(SynqxError::Expression(format!("Literal mapping '{}' is not a list", expr))),
        };
    }

    if let Some(captures) = rows_expr_regex().captures(expr) {
        let node_id = &captures[1];
        let items = inputs
            .chunks(node_id)
            .iter()
            .flat_map(|chunk| chunk.rows().iter().cloned().map(Value::Object))
            .collect();
        return Ok(items);
    }

    Err(SynqxError::Expression(format!(
        "Unsupported mapping expression: '{}'",
        expr
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use synqx_domain::row;

    fn inputs_with(node: &'static str, rows: usize) -> impl InputLookup {
        move |id: &str| {
            if id == node {
                vec![Chunk::new((0..rows).map(|i| row(&[("i", json!(i))])).collect())]
            } else {
                Vec::new()
            }
        }
    }

    #[test]
    fn test_count_comparisons() {
        let inputs = inputs_with("a", 3);
        assert!(evaluate_condition("inputs['a'].count > 2", &inputs).unwrap());
        assert!(!evaluate_condition("inputs['a'].count > 5", &inputs).unwrap());
        assert!(evaluate_condition("inputs['a'].count >= 3", &inputs).unwrap());
        assert!(evaluate_condition("inputs['a'].count == 3", &inputs).unwrap());
        assert!(evaluate_condition("inputs['a'].count != 4", &inputs).unwrap());
        assert!(evaluate_condition("inputs['a'].count < 10", &inputs).unwrap());
    }

    #[test]
    fn test_count_of_absent_node_is_zero() {
        let inputs = inputs_with("a", 3);
        assert!(evaluate_condition("inputs['ghost'].count == 0", &inputs).unwrap());
    }

    #[test]
    fn test_unsupported_condition_is_structured_error() {
        let inputs = inputs_with("a", 3);
        let err = evaluate_condition("__import__('os').system('rm -rf /')", &inputs).unwrap_err();
        assert!(matches!(err, SynqxError::Expression(_)));
        let err = evaluate_condition("inputs['a'].count > 1 or True", &inputs).unwrap_err();
        assert!(matches!(err, SynqxError::Expression(_)));
    }

    #[test]
    fn test_literal_list_mapping() {
        let inputs = inputs_with("a", 0);
        let items = evaluate_mapping(r#"[1, 2, 3]"#, &inputs).unwrap();
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);

        let items = evaluate_mapping(r#"[{"region": "eu"}, {"region": "us"}]"#, &inputs).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["region"], "eu");
    }

    #[test]
    fn test_rows_mapping() {
        let inputs = inputs_with("a", 2);
        let items = evaluate_mapping("inputs['a'].rows", &inputs).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["i"], 0);
    }

    #[test]
    fn test_invalid_mapping_is_structured_error() {
        let inputs = inputs_with("a", 0);
        assert!(matches!(
            evaluate_mapping("range(10)", &inputs),
            Err(SynqxError::Expression(_))
        ));
        assert!(matches!(
            evaluate_mapping("[1, 2,", &inputs),
            Err(SynqxError::Expression(_))
        ));
    }
}
