//! Architectural Enforcement Integration Tests
//!
//! This package scans the relay's production sources and fails the build
//! when they break the runtime rules the relay depends on:
//! - No sleeping as a substitute for waiting on an event
//! - No blocking I/O inside async code
//!
//! The checks live under `tests/`; this library only locates the sources.

use std::path::PathBuf;

/// Source directories holding production code, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Absolute paths of every production source directory
#[must_use]
pub fn production_dirs() -> Vec<PathBuf> {
    let root = workspace_root();
    PRODUCTION_DIRS.iter().map(|dir| root.join(dir)).collect()
}
