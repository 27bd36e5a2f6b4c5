//! Project data model.
//!
//! A [`Project`] is the fully resolved view of `elm-watch.json`: the watch
//! root, the ordered set of `elm.json` manifests, and per-target
//! [`OutputState`]s. The project is built once per run by the config
//! loader and mutated by the compile engine and by WebSocket-driven mode
//! changes until the next restart.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, OutputError};

// ============================================================================
// Compilation mode
// ============================================================================

/// How a target is handed to the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationMode {
    Standard,
    Debug,
    Optimize,
}

impl CompilationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Debug => "debug",
            Self::Optimize => "optimize",
        }
    }

    /// The compiler flag for this mode, if any.
    pub fn compiler_flag(self) -> Option<&'static str> {
        match self {
            Self::Standard => None,
            Self::Debug => Some("--debug"),
            Self::Optimize => Some("--optimize"),
        }
    }
}

/// Which top-level command is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Make,
    Hot,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Make => "make",
            Self::Hot => "hot",
        }
    }
}

// ============================================================================
// Output path
// ============================================================================

/// Where a target's artifact goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutputPath {
    /// A real file on disk, keeping the user-written form for display
    /// and for the WebSocket `output` parameter.
    Real { absolute: PathBuf, original: String },
    /// Compile-only sink: the target is typechecked, no artifact written.
    Null,
}

impl OutputPath {
    /// The user-facing name of this output (`/dev/null` for the sink).
    pub fn original(&self) -> &str {
        match self {
            Self::Real { original, .. } => original,
            Self::Null => "/dev/null",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Current result or in-progress phase of one target.
#[derive(Debug)]
pub enum Status {
    /// Initial state: nothing compiled yet this run.
    NotWrittenToDisk,
    QueuedForElmMake,
    ElmMake,
    /// Compile finished, postprocess pending. The compiled bytes live
    /// here (never re-read from disk).
    QueuedForPostprocess { code: Vec<u8> },
    Postprocess,
    /// Superseded by a new dirty flag before completion.
    Interrupted,
    Success {
        /// Final artifact bytes. Empty for typecheck-only compiles.
        code: Vec<u8>,
        /// Milliseconds since the Unix epoch, stamped at completion.
        compiled_timestamp: u64,
    },
    Error(OutputError),
}

impl Status {
    /// Whether a spawned process or worker is currently running for this
    /// target.
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::ElmMake | Self::Postprocess)
    }
}

// ============================================================================
// Output state
// ============================================================================

/// Per-target mutable state for the duration of a run.
#[derive(Debug)]
pub struct OutputState {
    /// Entry-point file paths, in order. Never empty.
    pub inputs: Vec<PathBuf>,
    pub compilation_mode: CompilationMode,
    /// Postprocess command vector. First token is either the literal
    /// `elm-watch-node` or an external executable name. Never empty when
    /// present.
    pub postprocess: Option<Vec<String>>,
    /// Absolute paths whose change affects this target.
    pub all_related_elm_file_paths: FxHashSet<PathBuf>,
    /// Artifact known stale; rebuild at next opportunity.
    pub dirty: bool,
    pub status: Status,
}

impl OutputState {
    pub fn new(inputs: Vec<PathBuf>, postprocess: Option<Vec<String>>) -> Self {
        let mut all_related: FxHashSet<PathBuf> = FxHashSet::default();
        all_related.extend(inputs.iter().cloned());
        Self {
            inputs,
            compilation_mode: CompilationMode::Standard,
            postprocess,
            all_related_elm_file_paths: all_related,
            dirty: true,
            status: Status::NotWrittenToDisk,
        }
    }
}

// ============================================================================
// Project
// ============================================================================

/// One `elm.json` manifest and the targets compiled against it.
#[derive(Debug)]
pub struct ElmJson {
    pub path: PathBuf,
    /// Declaration order from `elm-watch.json`; priority ties break on it.
    pub outputs: Vec<(OutputPath, OutputState)>,
}

/// Configuration error attached to a specific output.
///
/// Carried through the run and reprinted every compile cycle; a change to
/// any of its related paths triggers a restart so the loader can retry.
#[derive(Debug, Clone)]
pub struct ElmJsonErrorEntry {
    pub output_name: String,
    /// Files whose change may fix the error.
    pub related_paths: Vec<PathBuf>,
    pub error: ConfigError,
}

/// Fully resolved project. Immutable in shape for a run; target states
/// mutate inside.
#[derive(Debug)]
pub struct Project {
    /// Directory the filesystem watcher covers.
    pub watch_root: PathBuf,
    /// The `elm-watch.json` that produced this project.
    pub config_path: PathBuf,
    /// WebSocket port requested in the config file, if any.
    pub port_from_config: Option<u16>,
    pub elm_jsons: Vec<ElmJson>,
    pub elm_json_errors: Vec<ElmJsonErrorEntry>,
    /// Targets present in config but not enabled this run (original names).
    pub disabled_outputs: FxHashSet<String>,
}

impl Project {
    /// Iterate all enabled targets mutably, in declaration order.
    pub fn outputs_mut(&mut self) -> impl Iterator<Item = (&Path, &OutputPath, &mut OutputState)> {
        self.elm_jsons.iter_mut().flat_map(|elm_json| {
            let path = elm_json.path.as_path();
            elm_json
                .outputs
                .iter_mut()
                .map(move |(output, state)| (path, &*output, state))
        })
    }

    /// Iterate all enabled targets, in declaration order.
    pub fn outputs(&self) -> impl Iterator<Item = (&Path, &OutputPath, &OutputState)> {
        self.elm_jsons.iter().flat_map(|elm_json| {
            let path = elm_json.path.as_path();
            elm_json
                .outputs
                .iter()
                .map(move |(output, state)| (path, output, state))
        })
    }

    /// Find an enabled target by its original output name.
    pub fn find_by_original(&mut self, original: &str) -> Option<(&Path, &OutputPath, &mut OutputState)> {
        self.elm_jsons.iter_mut().find_map(|elm_json| {
            let path = elm_json.path.as_path();
            elm_json
                .outputs
                .iter_mut()
                .find(|(output, _)| output.original() == original)
                .map(move |(output, state)| (path, &*output, state))
        })
    }

    /// Original names of all enabled targets, in declaration order.
    pub fn enabled_originals(&self) -> Vec<String> {
        self.outputs()
            .map(|(_, output, _)| output.original().to_string())
            .collect()
    }

    /// Whether `path` is one of this project's `elm.json` manifests.
    pub fn owns_elm_json(&self, path: &Path) -> bool {
        self.elm_jsons.iter().any(|e| e.path == path)
    }

    pub fn num_executing(&self) -> usize {
        self.outputs().filter(|(_, _, s)| s.status.is_executing()).count()
    }

    pub fn num_interrupted(&self) -> usize {
        self.outputs()
            .filter(|(_, _, s)| matches!(s.status, Status::Interrupted))
            .count()
    }

    /// Whether any enabled target still has work to pick up.
    pub fn any_pending(&self) -> bool {
        self.outputs().any(|(_, _, s)| {
            s.dirty || matches!(s.status, Status::QueuedForPostprocess { .. } | Status::Interrupted)
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
