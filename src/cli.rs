//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use rustc_hash::FxHashSet;

use crate::project::CompilationMode;

/// Watch mode for the Elm compiler
#[derive(Parser, Debug, Clone)]
#[command(name = "elm-watch", version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Enable verbose output for debugging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Compile every target once and exit
    Make {
        /// Compile with the debugger enabled
        #[arg(long)]
        debug: bool,

        /// Compile with optimizations
        #[arg(long)]
        optimize: bool,

        /// Target names from elm-watch.json (default: all)
        #[arg(value_name = "TARGET")]
        targets: Vec<String>,
    },

    /// Watch, recompile on change, and push reloads to browsers
    Hot {
        /// Not valid in hot mode; the mode is per-target and set from
        /// the browser
        #[arg(long)]
        debug: bool,

        /// Not valid in hot mode; the mode is per-target and set from
        /// the browser
        #[arg(long)]
        optimize: bool,

        /// Target names from elm-watch.json (default: all)
        #[arg(value_name = "TARGET")]
        targets: Vec<String>,
    },
}

/// Argument misuse, reported with a non-1 exit code.
#[derive(Debug, PartialEq, Eq)]
pub enum BadUsage {
    DebugOptimizeClash,
    DebugOptimizeForHot,
    BadArgs { unknown: Vec<String>, known: Vec<String> },
}

impl BadUsage {
    pub fn message(&self) -> String {
        match self {
            Self::DebugOptimizeClash => {
                "--debug and --optimize cannot be used together".to_string()
            }
            Self::DebugOptimizeForHot => {
                "--debug and --optimize are not valid in hot mode; \
                 the compilation mode is per-target and set from the browser"
                    .to_string()
            }
            Self::BadArgs { unknown, known } => format!(
                "unknown targets: {}\nknown targets: {}",
                unknown.join(", "),
                known.join(", ")
            ),
        }
    }
}

/// The compilation mode requested by `make` flags.
pub fn make_mode(debug: bool, optimize: bool) -> Result<CompilationMode, BadUsage> {
    match (debug, optimize) {
        (true, true) => Err(BadUsage::DebugOptimizeClash),
        (true, false) => Ok(CompilationMode::Debug),
        (false, true) => Ok(CompilationMode::Optimize),
        (false, false) => Ok(CompilationMode::Standard),
    }
}

/// Hot mode rejects both flags.
pub fn check_hot_flags(debug: bool, optimize: bool) -> Result<(), BadUsage> {
    if debug || optimize { Err(BadUsage::DebugOptimizeForHot) } else { Ok(()) }
}

/// Validate positional target names against the config. Empty means
/// all targets.
pub fn enabled_targets(
    targets: &[String],
    known: &[String],
) -> Result<Option<FxHashSet<String>>, BadUsage> {
    if targets.is_empty() {
        return Ok(None);
    }
    let unknown: Vec<String> =
        targets.iter().filter(|t| !known.contains(t)).cloned().collect();
    if unknown.is_empty() {
        Ok(Some(targets.iter().cloned().collect()))
    } else {
        Err(BadUsage::BadArgs { unknown, known: known.to_vec() })
    }
}

// ============================================================================
// Tests
// ============================================================================
