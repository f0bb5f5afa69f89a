// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Sandbox Enforcement
//!
//! File and system ephemeral operations resolve paths strictly under the
//! agent's sandbox root. Resolution canonicalizes the deepest existing
//! ancestor, so traversal tricks (`..`, symlinks out of the root) fail
//! with `SandboxViolation` before any filesystem operation runs.
//!
//! Package-manager calls validate the requested package against a strict
//! allow-list regex; anything that could smuggle shell metacharacters is
//! rejected.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use synqx_domain::SynqxError;

/// Allow-list for package specifiers (name plus optional version pin).
pub fn package_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-==.<>]+$").expect("package regex is valid"))
}

/// Validates a package specifier against the allow-list.
pub fn validate_package_name(package: &str) -> Result<(), SynqxError> {
    if package.is_empty() || !package_name_regex().is_match(package) {
        return Err(SynqxError::SandboxViolation(format!(
            "Invalid package name: '{}'",
            package
        )));
    }
    Ok(())
}

/// Resolves `requested` under `sandbox_root`, rejecting any path that
/// escapes the root after normalization and symlink resolution.
pub fn resolve_sandboxed(sandbox_root: &Path, requested: &str) -> Result<PathBuf, SynqxError> {
    std::fs::create_dir_all(sandbox_root)
        .map_err(|e| SynqxError::Io(format!("Failed to create sandbox: {}", e)))?;
    let root = sandbox_root
        .canonicalize()
        .map_err(|e| SynqxError::Io(format!("Failed to canonicalize sandbox root: {}", e)))?;

    // Normalize lexically first; absolute requests are re-rooted
    let mut target = root.clone();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::ParentDir => {
                target.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    // Canonicalize the deepest existing ancestor so symlinks cannot point
    // outside the root
    let mut probe = target.clone();
    let mut suffix = Vec::new();
    let resolved_base = loop {
        match probe.canonicalize() {
            Ok(resolved) => break resolved,
            Err(_) => match (probe.parent(), probe.file_name()) {
                (Some(parent), Some(name)) => {
                    suffix.push(name.to_os_string());
                    probe = parent.to_path_buf();
                }
                _ => break root.clone(),
            },
        }
    };
    let mut resolved = resolved_base;
    for part in suffix.iter().rev() {
        resolved.push(part);
    }

    if !resolved.starts_with(&root) {
        return Err(SynqxError::SandboxViolation(format!(
            "Access denied to '{}': escapes the sandbox",
            requested
        )));
    }
    Ok(resolved)
}
