// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Data Cache
//!
//! Thread-safe keyed store for inter-node chunk lists with a RAM budget,
//! LRU eviction, and spill-to-disk.
//!
//! ## Contract
//!
//! - `store` replaces any prior entry for the node and updates recency.
//!   When insertion would exceed the budget, least-recently-used entries
//!   are spilled to disk (one serialized file per chunk) until the new
//!   entry fits or nothing evictable remains.
//! - `retrieve` returns chunks from RAM or loads them back from spill,
//!   updating recency either way. Unknown nodes yield an empty list.
//! - `clear_node` drops both the RAM and disk footprint.
//!
//! ## Invariant
//!
//! After every `store`, the sum of in-RAM chunk byte estimates never
//! exceeds the configured budget, except in the degenerate case where a
//! single entry alone exceeds the whole budget and spilling it failed.
//!
//! ## Concurrency
//!
//! A single mutex guards all mutations. Spill-load I/O currently happens
//! under the lock; callers treat `retrieve` of a spilled node as a blocking
//! suspension point.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use synqx_domain::{Chunk, SynqxError};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Cache statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub nodes_in_ram: usize,
    pub nodes_spilled: usize,
    pub memory_mb: f64,
    pub memory_limit_mb: u64,
    pub utilization_pct: f64,
    pub spill_dir: String,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Vec<Chunk>>,
    spilled: HashMap<String, Vec<PathBuf>>,
    /// LRU order, oldest first.
    access_order: Vec<String>,
    current_bytes: u64,
}

impl CacheInner {
    fn touch(&mut self, node_id: &str) {
        self.access_order.retain(|id| id != node_id);
        self.access_order.push(node_id.to_string());
    }

    fn forget(&mut self, node_id: &str) {
        self.access_order.retain(|id| id != node_id);
    }
}

/// Thread-safe chunk cache with a RAM budget and spill-to-disk overflow.
pub struct DataCache {
    inner: Mutex<CacheInner>,
    memory_limit_bytes: u64,
    spill_dir: PathBuf,
    // Keeps the default spill directory alive for the cache's lifetime.
    _owned_dir: Option<tempfile::TempDir>,
}

impl DataCache {
    /// Creates a cache with the given RAM budget and a private temporary
    /// spill directory.
    pub fn new(memory_limit_mb: u64) -> Result<Self, SynqxError> {
        let dir = tempfile::Builder::new()
            .prefix("synqx_spill_")
            .tempdir()
            .map_err(|e| SynqxError::Io(format!("Failed to create spill directory: {}", e)))?;
        let spill_dir = dir.path().to_path_buf();
        info!(limit_mb = memory_limit_mb, spill_dir = %spill_dir.display(), "data cache initialized");
        Ok(Self {
            inner: Mutex::new(CacheInner::default()),
            memory_limit_bytes: memory_limit_mb.saturating_mul(1024 * 1024),
            spill_dir,
            _owned_dir: Some(dir),
        })
    }

    /// Creates a cache spilling into a caller-provided directory.
    pub fn with_spill_dir(memory_limit_mb: u64, spill_dir: impl AsRef<Path>) -> Result<Self, SynqxError> {
        let spill_dir = spill_dir.as_ref().to_path_buf();
        fs::create_dir_all(&spill_dir)
            .map_err(|e| SynqxError::Io(format!("Failed to create spill directory: {}", e)))?;
        Ok(Self {
            inner: Mutex::new(CacheInner::default()),
            memory_limit_bytes: memory_limit_mb.saturating_mul(1024 * 1024),
            spill_dir,
            _owned_dir: None,
        })
    }

    /// Stores chunks for a node, replacing any prior entry and spilling LRU
    /// entries when the budget would be exceeded.
    pub fn store(&self, node_id: &str, chunks: Vec<Chunk>) {
        let incoming_bytes: u64 = chunks.iter().map(Chunk::estimated_bytes).sum();
        let mut inner = self.inner.lock();

        // Replace any prior footprint for this node before accounting.
        if let Some(old) = inner.entries.remove(node_id) {
            let old_bytes: u64 = old.iter().map(Chunk::estimated_bytes).sum();
            inner.current_bytes = inner.current_bytes.saturating_sub(old_bytes);
        }
        Self::cleanup_spill_files(&mut inner, node_id);

        if inner.current_bytes + incoming_bytes > self.memory_limit_bytes {
            warn!(
                node_id,
                current_mb = inner.current_bytes as f64 / BYTES_PER_MB,
                incoming_mb = incoming_bytes as f64 / BYTES_PER_MB,
                limit_mb = self.memory_limit_bytes as f64 / BYTES_PER_MB,
                "memory pressure detected, spilling LRU entries"
            );
            self.apply_spill_strategy(&mut inner, incoming_bytes);
        }

        inner.current_bytes += incoming_bytes;
        debug!(
            node_id,
            chunks = chunks.len(),
            total_mb = inner.current_bytes as f64 / BYTES_PER_MB,
            "cached node output"
        );
        inner.entries.insert(node_id.to_string(), chunks);
        inner.touch(node_id);
    }

    /// Retrieves chunks for a node from RAM or spill. Unknown nodes return
    /// an empty list.
    pub fn retrieve(&self, node_id: &str) -> Vec<Chunk> {
        let mut inner = self.inner.lock();

        if let Some(chunks) = inner.entries.get(node_id) {
            let chunks = chunks.clone();
            inner.touch(node_id);
            return chunks;
        }

        if inner.spilled.contains_key(node_id) {
            return self.load_from_spill(&mut inner, node_id);
        }

        Vec::new()
    }

    /// Drops both the RAM and disk footprint of a node.
    pub fn clear_node(&self, node_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(chunks) = inner.entries.remove(node_id) {
            let freed: u64 = chunks.iter().map(Chunk::estimated_bytes).sum();
            inner.current_bytes = inner.current_bytes.saturating_sub(freed);
        }
        Self::cleanup_spill_files(&mut inner, node_id);
        inner.forget(node_id);
    }

    /// Evicts (spills) least-recently-used entries until utilization drops
    /// to `target_pct` or nothing evictable remains. Used by the runner's
    /// post-layer memory management.
    pub fn evict_to_utilization(&self, target_pct: f64) {
        let target_bytes = (self.memory_limit_bytes as f64 * target_pct / 100.0) as u64;
        let mut inner = self.inner.lock();
        let order: Vec<String> = inner.access_order.clone();
        for node_id in order {
            if inner.current_bytes <= target_bytes {
                break;
            }
            if inner.entries.contains_key(&node_id) {
                self.spill_node(&mut inner, &node_id);
            }
        }
    }

    /// Node ids currently resident in RAM.
    pub fn resident_nodes(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let memory_mb = inner.current_bytes as f64 / BYTES_PER_MB;
        let limit_mb = self.memory_limit_bytes as f64 / BYTES_PER_MB;
        let utilization_pct = if self.memory_limit_bytes > 0 {
            (inner.current_bytes as f64 / self.memory_limit_bytes as f64) * 100.0
        } else {
            0.0
        };
        CacheStats {
            nodes_in_ram: inner.entries.len(),
            nodes_spilled: inner.spilled.len(),
            memory_mb: (memory_mb * 100.0).round() / 100.0,
            memory_limit_mb: limit_mb as u64,
            utilization_pct: (utilization_pct * 100.0).round() / 100.0,
            spill_dir: self.spill_dir.display().to_string(),
        }
    }

    /// Clears everything, RAM and disk.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        let spilled: Vec<String> = inner.spilled.keys().cloned().collect();
        for node_id in spilled {
            Self::cleanup_spill_files(&mut inner, &node_id);
        }
        inner.entries.clear();
        inner.access_order.clear();
        inner.current_bytes = 0;
    }

    fn apply_spill_strategy(&self, inner: &mut CacheInner, required_bytes: u64) {
        let order: Vec<String> = inner.access_order.clone();
        for node_id in order {
            if !inner.entries.contains_key(&node_id) {
                continue;
            }
            self.spill_node(inner, &node_id);
            if inner.current_bytes + required_bytes <= self.memory_limit_bytes {
                break;
            }
        }
    }

    /// Serializes a node's chunks to disk and drops the RAM entry. On any
    /// write failure the entry is restored to RAM untouched.
    fn spill_node(&self, inner: &mut CacheInner, node_id: &str) {
        let Some(chunks) = inner.entries.remove(node_id) else {
            return;
        };
        let bytes: u64 = chunks.iter().map(Chunk::estimated_bytes).sum();

        let mut paths = Vec::with_capacity(chunks.len());
        let mut spill_error = None;
        for (idx, chunk) in chunks.iter().enumerate() {
            let path = self.spill_dir.join(format!("{}_{}.spill", node_id, idx));
            let result = serde_json::to_vec(chunk)
                .map_err(SynqxError::from)
                .and_then(|buf| fs::write(&path, buf).map_err(SynqxError::from));
            match result {
                Ok(()) => paths.push(path),
                Err(e) => {
                    spill_error = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = spill_error {
            error!(node_id, error = %e, "spill failed, keeping node in RAM");
            for stale in &paths {
                let _ = fs::remove_file(stale);
            }
            inner.entries.insert(node_id.to_string(), chunks);
            return;
        }

        inner.current_bytes = inner.current_bytes.saturating_sub(bytes);
        inner.spilled.insert(node_id.to_string(), paths);
        info!(node_id, freed_mb = bytes as f64 / BYTES_PER_MB, "spilled node to disk");
    }

    fn load_from_spill(&self, inner: &mut CacheInner, node_id: &str) -> Vec<Chunk> {
        let paths = inner.spilled.get(node_id).cloned().unwrap_or_default();
        let mut chunks = Vec::with_capacity(paths.len());
        for path in &paths {
            match fs::read(path).map_err(SynqxError::from).and_then(|buf| {
                serde_json::from_slice::<Chunk>(&buf).map_err(SynqxError::from)
            }) {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => {
                    error!(node_id, path = %path.display(), error = %e, "failed to load spilled chunk");
                }
            }
        }
        inner.touch(node_id);
        chunks
    }

    fn cleanup_spill_files(inner: &mut CacheInner, node_id: &str) {
        if let Some(paths) = inner.spilled.remove(node_id) {
            for path in paths {
                let _ = fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use synqx_domain::row;

    fn chunk_of_bytes(approx_bytes: usize) -> Chunk {
        // Each row estimates to ~180 bytes (100-byte payload plus overhead)
        let rows = (0..approx_bytes / 180)
            .map(|i| row(&[("payload", json!("x".repeat(100))), ("i", json!(i))]))
            .collect();
        Chunk::new(rows)
    }

    #[test]
    fn test_store_and_retrieve_round_trip() {
        let cache = DataCache::new(64).unwrap();
        let chunk = Chunk::new(vec![row(&[("x", json!(1))])]);
        cache.store("a", vec![chunk.clone()]);
        let got = cache.retrieve("a");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], chunk);
    }

    #[test]
    fn test_missing_node_returns_empty() {
        let cache = DataCache::new(64).unwrap();
        assert!(cache.retrieve("ghost").is_empty());
    }

    #[test]
    fn test_store_replaces_prior_entry() {
        let cache = DataCache::new(64).unwrap();
        cache.store("a", vec![Chunk::new(vec![row(&[("x", json!(1))])])]);
        cache.store("a", vec![Chunk::new(vec![row(&[("x", json!(2))]), row(&[("x", json!(3))])])]);
        let got = cache.retrieve("a");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].row_count(), 2);
        assert_eq!(cache.stats().nodes_in_ram, 1);
    }

    #[test]
    fn test_spill_under_memory_pressure_and_reload() {
        // 1 MB budget, ~600 KB entries: storing the second spills the first
        let cache = DataCache::new(1).unwrap();
        cache.store("first", vec![chunk_of_bytes(600_000)]);
        cache.store("second", vec![chunk_of_bytes(600_000)]);

        let stats = cache.stats();
        assert_eq!(stats.nodes_spilled, 1);
        assert_eq!(stats.nodes_in_ram, 1);
        assert!(stats.memory_mb <= stats.memory_limit_mb as f64);

        // Spilled node loads back from disk intact
        let reloaded = cache.retrieve("first");
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded[0].row_count() > 0);
    }

    #[test]
    fn test_ram_budget_invariant_across_many_stores() {
        let cache = DataCache::new(1).unwrap();
        for i in 0..8 {
            cache.store(&format!("n{}", i), vec![chunk_of_bytes(400_000)]);
            let stats = cache.stats();
            assert!(
                stats.memory_mb <= stats.memory_limit_mb as f64,
                "budget exceeded after store {}: {:?}",
                i,
                stats
            );
        }
    }

    #[test]
    fn test_clear_node_drops_ram_and_disk() {
        let cache = DataCache::new(1).unwrap();
        cache.store("a", vec![chunk_of_bytes(600_000)]);
        cache.store("b", vec![chunk_of_bytes(600_000)]); // spills a
        cache.clear_node("a");
        cache.clear_node("b");
        assert!(cache.retrieve("a").is_empty());
        assert!(cache.retrieve("b").is_empty());
        let stats = cache.stats();
        assert_eq!(stats.nodes_in_ram, 0);
        assert_eq!(stats.nodes_spilled, 0);
        assert_eq!(stats.memory_mb, 0.0);
    }

    #[test]
    fn test_evict_to_utilization() {
        let cache = DataCache::new(10).unwrap();
        for i in 0..5 {
            cache.store(&format!("n{}", i), vec![chunk_of_bytes(1_500_000)]);
        }
        cache.evict_to_utilization(30.0);
        let stats = cache.stats();
        assert!(stats.utilization_pct <= 35.0, "still at {:?}", stats);
    }

    #[test]
    fn test_concurrent_store_retrieve() {
        use std::sync::Arc;
        let cache = Arc::new(DataCache::new(16).unwrap());
        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let id = format!("node_{}", (t + i) % 4);
                    cache.store(&id, vec![Chunk::new(vec![row(&[("t", json!(t)), ("i", json!(i))])])]);
                    let _ = cache.retrieve(&id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = cache.stats();
        assert!(stats.memory_mb <= stats.memory_limit_mb as f64);
    }
}
