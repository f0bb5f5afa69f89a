// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Watermark Value Object
//!
//! A [`WatermarkValue`] wraps the JSON scalar stored as an incremental
//! checkpoint and defines the one total ordering used everywhere a watermark
//! is compared: the extract filter (`value <= watermark` rows are dropped),
//! high-watermark tracking, and the store's monotonic `advance`.
//!
//! ## Ordering Rules
//!
//! Comparison is type-directed, mirroring the resilient coercion the
//! original engine applied to live data:
//!
//! 1. **Numeric** when both sides coerce to `f64` (numbers, or numeric
//!    strings with whitespace/thousands separators stripped)
//! 2. **Datetime** when both sides parse as RFC 3339,
//!    `%Y-%m-%d %H:%M:%S`, or `%Y-%m-%d` (naive values are assumed UTC)
//! 3. **Lexicographic string** comparison otherwise
//!
//! Datetimes serialize as ISO-8601 strings and compare correctly after a
//! round trip through JSON.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON scalar with the watermark comparison semantics attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct WatermarkValue(pub Value);

impl WatermarkValue {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Builds a watermark value from a UTC datetime, serialized ISO-8601.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(Value::String(dt.to_rfc3339()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Compares two watermark values with the type-directed total ordering.
    pub fn compare(&self, other: &WatermarkValue) -> Ordering {
        if let (Some(a), Some(b)) = (coerce_numeric(&self.0), coerce_numeric(&other.0)) {
            return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        }
        if let (Some(a), Some(b)) = (coerce_datetime(&self.0), coerce_datetime(&other.0)) {
            return a.cmp(&b);
        }
        render(&self.0).cmp(&render(&other.0))
    }

    /// Whether `self` is strictly greater than `other`. This is the advance
    /// predicate: watermarks only move forward.
    pub fn is_after(&self, other: &WatermarkValue) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl From<Value> for WatermarkValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", render(&self.0))
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric coercion: JSON numbers directly, strings after stripping
/// whitespace and thousands separators. Strings that also parse as dates
/// are left to the datetime path.
fn coerce_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned = s.trim().replace(',', "");
            if cleaned.is_empty() || coerce_datetime(value).is_some() {
                return None;
            }
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Datetime coercion with timezone normalization: offset-aware values keep
/// their instant, naive values are interpreted as UTC.
fn coerce_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}
