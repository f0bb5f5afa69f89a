// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Forensic Capture
//!
//! Best-effort snapshot of every chunk a node sees, written to a per-run
//! directory as parquet files named `<node_id>_<direction>.parquet`.
//! Capture appends in blocks: each captured chunk becomes one row group in
//! the file for its `(node, direction)` pair.
//!
//! Capture never blocks or fails the main stream. Every error is logged at
//! debug/warn level and swallowed; the run's correctness does not depend
//! on forensic output existing.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::Schema;
use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::json::ReaderBuilder;
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use serde_json::Value;
use tracing::{debug, warn};

use synqx_domain::Chunk;

/// Default on-disk location for forensic artifacts.
pub const DEFAULT_FORENSIC_BASE: &str = "data/forensics";

struct OpenCapture {
    schema: Arc<Schema>,
    writer: ArrowWriter<File>,
}

/// Best-effort chunk capture for one pipeline run.
pub struct ForensicSniffer {
    run_dir: PathBuf,
    enabled: bool,
    captures: Mutex<HashMap<String, OpenCapture>>,
}

impl ForensicSniffer {
    /// A sniffer rooted at `<base>/run_<run_id>/`. The directory is created
    /// lazily on first capture.
    pub fn new(base: impl AsRef<Path>, run_id: i64) -> Self {
        Self {
            run_dir: base.as_ref().join(format!("run_{}", run_id)),
            enabled: true,
            captures: Mutex::new(HashMap::new()),
        }
    }

    /// A sniffer that captures nothing. Used when forensics are disabled.
    pub fn disabled() -> Self {
        Self {
            run_dir: PathBuf::new(),
            enabled: false,
            captures: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The file a `(node, direction)` pair is captured to.
    pub fn capture_path(&self, node_id: &str, direction: &str) -> PathBuf {
        self.run_dir.join(format!("{}_{}.parquet", node_id, direction))
    }

    /// Appends a chunk as one block to the capture file of
    /// `(node, direction)`. Best-effort: failures are logged, never raised.
    pub fn capture_chunk(&self, node_id: &str, chunk: &Chunk, direction: &str) {
        if !self.enabled || chunk.is_empty() {
            return;
        }
        if let Err(e) = self.try_capture(node_id, chunk, direction) {
            warn!(node_id, direction, error = %e, "forensic capture failed, continuing");
        }
    }

    /// Closes every open capture file, flushing parquet footers.
    pub fn finalize(&self) {
        let mut captures = self.captures.lock();
        for (key, capture) in captures.drain() {
            if let Err(e) = capture.writer.close() {
                warn!(capture = %key, error = %e, "failed to close forensic capture file");
            }
        }
    }

    fn try_capture(&self, node_id: &str, chunk: &Chunk, direction: &str) -> Result<(), String> {
        let key = format!("{}_{}", node_id, direction);
        let mut captures = self.captures.lock();

        if !captures.contains_key(&key) {
            fs::create_dir_all(&self.run_dir).map_err(|e| e.to_string())?;
            let schema = Arc::new(infer_schema(chunk)?);
            let file = File::create(self.capture_path(node_id, direction)).map_err(|e| e.to_string())?;
            let writer = ArrowWriter::try_new(file, Arc::clone(&schema), None).map_err(|e| e.to_string())?;
            captures.insert(key.clone(), OpenCapture { schema, writer });
            debug!(node_id, direction, "opened forensic capture file");
        }

        let capture = captures.get_mut(&key).expect("capture entry just ensured");
        let mut decoder = ReaderBuilder::new(Arc::clone(&capture.schema))
            .build_decoder()
            .map_err(|e| e.to_string())?;
        decoder.serialize(chunk.rows()).map_err(|e| e.to_string())?;
        if let Some(batch) = decoder.flush().map_err(|e| e.to_string())? {
            capture.writer.write(&batch).map_err(|e| e.to_string())?;
            // One row group per captured block
            capture.writer.flush().map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

impl Drop for ForensicSniffer {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn infer_schema(chunk: &Chunk) -> Result<Schema, String> {
    let values = chunk
        .rows()
        .iter()
        .map(|row| Ok(Value::Object(row.clone())));
    infer_json_schema_from_iterator(values).map_err(|e| e.to_string())
}
