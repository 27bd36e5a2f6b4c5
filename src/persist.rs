//! Runtime state persistence.
//!
//! A small JSON file under `elm-stuff/elm-watch/` remembers the
//! WebSocket port and every target whose compilation mode differs from
//! `standard`, so a restarted hot session picks up where the last one
//! left off. Writes are best-effort: a failure is recorded and surfaced
//! as a non-fatal log entry after the next compile, then retried on the
//! next scheduled write.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::project::{CompilationMode, Project};

const STATE_DIR: &str = "elm-stuff/elm-watch";
const STATE_FILE: &str = "state.json";

// ============================================================================
// File format
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub port: u16,
    /// Original output path → per-target state. Targets in `standard`
    /// mode are never written.
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedOutput {
    #[serde(rename = "compilationMode")]
    pub compilation_mode: CompilationMode,
}

impl PersistedState {
    /// Snapshot the persistable parts of a project.
    pub fn from_project(port: u16, project: &Project) -> Self {
        let mut outputs = serde_json::Map::new();
        for (_, output, state) in project.outputs() {
            if state.compilation_mode != CompilationMode::Standard {
                let persisted = PersistedOutput { compilation_mode: state.compilation_mode };
                if let Ok(value) = serde_json::to_value(persisted) {
                    outputs.insert(output.original().to_string(), value);
                }
            }
        }
        Self { port, outputs }
    }

    /// The persisted mode for an output, if any.
    pub fn mode_for(&self, original: &str) -> Option<CompilationMode> {
        let value = self.outputs.get(original)?;
        let persisted: PersistedOutput = serde_json::from_value(value.clone()).ok()?;
        Some(persisted.compilation_mode)
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Writer for the state file. Owns the last write failure so the hot
/// loop can report it at a quiet moment.
pub struct PersistHandle {
    path: PathBuf,
    last_error: Option<String>,
}

impl PersistHandle {
    pub fn new(watch_root: &Path) -> Self {
        Self { path: state_path(watch_root), last_error: None }
    }

    /// Rewrite the state file. Never fails; errors are recorded.
    pub fn write(&mut self, state: &PersistedState) {
        match try_write(&self.path, state) {
            Ok(()) => self.last_error = None,
            Err(e) => self.last_error = Some(e.to_string()),
        }
    }

    /// Take the pending write error, if any, for logging.
    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }
}

fn state_path(watch_root: &Path) -> PathBuf {
    watch_root.join(STATE_DIR).join(STATE_FILE)
}

fn try_write(path: &Path, state: &PersistedState) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(state)?;
    fs::write(path, json)
}

/// Restore persisted state, if a readable one exists.
pub fn restore(watch_root: &Path) -> Option<PersistedState> {
    let json = fs::read_to_string(state_path(watch_root)).ok()?;
    serde_json::from_str(&json).ok()
}

// ============================================================================
// Tests
// ============================================================================
