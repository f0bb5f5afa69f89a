// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Asset and Connection References
//!
//! Assets and connections are owned by external collaborators; the core only
//! consumes the narrow view defined here. An [`Asset`] names a datum and
//! carries the incremental metadata the executor needs; a
//! [`ConnectionPayload`] is the resolved credential blob handed to agents
//! inside the lease payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named external datum (table, file, endpoint) as the core sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: i64,
    pub connection_id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fully_qualified_name: Option<String>,
    #[serde(default)]
    pub is_incremental_capable: bool,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

impl Asset {
    /// The identifier handed to connectors: the fully qualified name when
    /// present, the plain name otherwise.
    pub fn identifier(&self) -> &str {
        self.fully_qualified_name.as_deref().unwrap_or(&self.name)
    }

    /// The configured watermark column, if any. Lookup is case-tolerant the
    /// way the original engine treated asset configs.
    pub fn watermark_column(&self) -> Option<&str> {
        self.config
            .get("watermark_column")
            .or_else(|| self.config.get("WATERMARK_COLUMN"))
            .and_then(Value::as_str)
    }
}

/// Resolved connection configuration shipped to an agent at lease time.
///
/// `config` is already decrypted; it never touches persistent storage in
/// this form and is handed to workers by value, immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub id: i64,
    #[serde(rename = "type")]
    pub connector_type: String,
    pub config: serde_json::Map<String, Value>,
}
