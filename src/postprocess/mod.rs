//! Postprocess stage.
//!
//! A target's `postprocess` command transforms the compiled bytes. Two
//! forms exist: the literal `elm-watch-node` first token routes through
//! the worker pool; any other first token is an external executable that
//! receives the bytes on stdin and writes the transformed bytes to
//! stdout.

pub mod worker;

use std::path::Path;

use crate::errors::OutputError;
use crate::project::{CompilationMode, RunMode};
use crate::spawn::{Cmd, ExitReason, SpawnResult};
use worker::{PostprocessReply, PostprocessRequest, WorkerPool};

/// First token selecting the worker-pool form.
pub const ELM_WATCH_NODE: &str = "elm-watch-node";

/// Run one postprocess and return the transformed bytes.
pub fn run(
    pool: &WorkerPool,
    watch_root: &Path,
    command: &[String],
    target_name: &str,
    mode: CompilationMode,
    run_mode: RunMode,
    code: Vec<u8>,
) -> Result<Vec<u8>, OutputError> {
    match command.split_first() {
        Some((first, user_args)) if first == ELM_WATCH_NODE => {
            run_in_worker(pool, watch_root, user_args, target_name, mode, run_mode, code)
        }
        Some(_) => run_external(watch_root, command, target_name, mode, run_mode, code),
        None => Ok(code),
    }
}

// ============================================================================
// elm-watch-node form
// ============================================================================

fn run_in_worker(
    pool: &WorkerPool,
    watch_root: &Path,
    user_args: &[String],
    target_name: &str,
    mode: CompilationMode,
    run_mode: RunMode,
    code: Vec<u8>,
) -> Result<Vec<u8>, OutputError> {
    // Workers cannot ship binary buffers across the boundary; the code
    // crosses as a string and is re-encoded on receipt.
    let code = String::from_utf8(code)
        .map_err(|e| OutputError::StdoutDecodeError { error: e.to_string() })?;

    let request = PostprocessRequest {
        cwd: watch_root.display().to_string(),
        user_args: user_args.to_vec(),
        extra_args: vec![
            target_name.to_string(),
            mode.as_str().to_string(),
            run_mode.as_str().to_string(),
        ],
        code,
    };

    let worker = pool.get_or_create_available_worker()?;
    match worker.postprocess(&request) {
        PostprocessReply::Resolve { code } => Ok(code.into_bytes()),
        PostprocessReply::Reject(error) => Err(error),
    }
}

// ============================================================================
// External executable form
// ============================================================================

fn run_external(
    watch_root: &Path,
    command: &[String],
    target_name: &str,
    mode: CompilationMode,
    run_mode: RunMode,
    code: Vec<u8>,
) -> Result<Vec<u8>, OutputError> {
    let display = command.join(" ");
    let result = Cmd::from_slice(command)
        .arg(target_name)
        .arg(mode.as_str())
        .arg(run_mode.as_str())
        .cwd(watch_root)
        .stdin(code)
        .run();

    match result {
        SpawnResult::CommandNotFound => Err(OutputError::CommandNotFound { command: display }),
        SpawnResult::OtherSpawnError(error) => Err(OutputError::OtherSpawnError { error }),
        SpawnResult::StdinWriteError(error) => {
            Err(OutputError::PostprocessStdinWriteError { command: display, error })
        }
        SpawnResult::Exit { reason: ExitReason::ExitCode(0), stdout, .. } => Ok(stdout),
        SpawnResult::Exit { reason, stderr, .. } => Err(OutputError::PostprocessNonZeroExit {
            command: display,
            exit: match reason {
                ExitReason::ExitCode(code) => format!("exit code {code}"),
                ExitReason::Signal(name) => format!("signal {name}"),
                ExitReason::Unknown => "an unknown reason".to_string(),
            },
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn root() -> PathBuf {
        std::env::temp_dir()
    }

    #[test]
    fn test_external_identity_transform() {
        let code = b"var app = {};".to_vec();
        let out = run_external(
            &root(),
            &["cat".to_string()],
            "main",
            CompilationMode::Standard,
            RunMode::Hot,
            code.clone(),
        )
        .unwrap();
        assert_eq!(out, code);
    }

    #[test]
    fn test_external_receives_contract_argv() {
        // Echo the argv we were called with; the contract appends
        // target name, compilation mode, and run mode after user args.
        let out = run_external(
            &root(),
            &["sh".to_string(), "-c".to_string(), r#"printf '%s %s %s %s' "$0" "$1" "$2" "$3""#.to_string(), "user-arg".to_string()],
            "main",
            CompilationMode::Debug,
            RunMode::Make,
            Vec::new(),
        )
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&out), "user-arg main debug make");
    }

    #[test]
    fn test_external_nonzero_exit() {
        let result = run_external(
            &root(),
            &["sh".to_string(), "-c".to_string(), "echo oops >&2; exit 2".to_string()],
            "main",
            CompilationMode::Standard,
            RunMode::Hot,
            Vec::new(),
        );
        match result {
            Err(OutputError::PostprocessNonZeroExit { exit, stderr, .. }) => {
                assert_eq!(exit, "exit code 2");
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("expected non-zero exit, got {other:?}"),
        }
    }

    #[test]
    fn test_external_command_not_found() {
        let result = run_external(
            &root(),
            &["no-such-postprocess-tool".to_string()],
            "main",
            CompilationMode::Standard,
            RunMode::Hot,
            Vec::new(),
        );
        assert!(matches!(result, Err(OutputError::CommandNotFound { .. })));
    }

    #[test]
    fn test_worker_form_rejects_invalid_utf8() {
        let pool = WorkerPool::new();
        let result = run_in_worker(
            &pool,
            &root(),
            &["script.js".to_string()],
            "main",
            CompilationMode::Standard,
            RunMode::Hot,
            vec![0xff, 0xfe],
        );
        assert!(matches!(result, Err(OutputError::StdoutDecodeError { .. })));
    }
}
