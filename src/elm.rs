//! Interface to the external compiler.
//!
//! The compiler is a single-shot process: it takes inputs plus flags and
//! either writes the artifact or emits a structured JSON report on
//! stderr. This module invokes it and classifies the outcome; it never
//! inspects source files itself.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{CompileErrors, GeneralError, OutputError};
use crate::project::CompilationMode;
use crate::spawn::{Cmd, ExitReason, SpawnResult};

/// Name of the compiler executable.
pub const ELM_BINARY: &str = "elm";

// ============================================================================
// Compile
// ============================================================================

/// Whether a compile should produce the artifact bytes or just typecheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactMode {
    Full,
    TypecheckOnly,
}

/// Successful compile outcome. `code` is empty for typecheck-only runs.
#[derive(Debug)]
pub struct Compiled {
    pub code: Vec<u8>,
}

/// Run one compile for a target.
///
/// The compiler writes to a temporary file which is read into memory and
/// deleted; the returned buffer is the source of truth from then on.
pub fn make(
    elm_json_path: &Path,
    inputs: &[PathBuf],
    mode: CompilationMode,
    artifact: ArtifactMode,
) -> Result<Compiled, OutputError> {
    let cwd = manifest_dir(elm_json_path);

    let temp = match artifact {
        ArtifactMode::TypecheckOnly => None,
        ArtifactMode::Full => match tempfile::Builder::new().suffix(".js").tempfile() {
            Ok(file) => Some(file),
            Err(e) => return Err(OutputError::OtherSpawnError { error: e.to_string() }),
        },
    };
    let output_arg = match &temp {
        None => "/dev/null".to_string(),
        Some(file) => file.path().display().to_string(),
    };

    let mut cmd = Cmd::new(ELM_BINARY)
        .arg("make")
        .arg("--report=json")
        .arg(format!("--output={output_arg}"))
        .cwd(cwd);
    if let Some(flag) = mode.compiler_flag() {
        cmd = cmd.arg(flag);
    }
    let result = cmd.args(inputs).run();

    match result {
        SpawnResult::CommandNotFound => {
            Err(OutputError::ElmNotFound { command: ELM_BINARY.to_string() })
        }
        SpawnResult::OtherSpawnError(error) | SpawnResult::StdinWriteError(error) => {
            Err(OutputError::OtherSpawnError { error })
        }
        SpawnResult::Exit { reason: ExitReason::ExitCode(0), .. } => {
            let code = match temp {
                None => Vec::new(),
                Some(file) => {
                    // into_file would keep the tempfile alive; read + drop deletes it
                    std::fs::read(file.path())
                        .map_err(|e| OutputError::StdoutDecodeError { error: e.to_string() })?
                }
            };
            Ok(Compiled { code })
        }
        SpawnResult::Exit { stdout, stderr, .. } => Err(classify_make_failure(&stdout, &stderr)),
    }
}

fn manifest_dir(elm_json_path: &Path) -> PathBuf {
    elm_json_path.parent().unwrap_or(Path::new(".")).to_path_buf()
}

fn classify_make_failure(stdout: &[u8], stderr: &[u8]) -> OutputError {
    let stderr_str = String::from_utf8_lossy(stderr);
    let trimmed = stderr_str.trim();
    if !trimmed.starts_with('{') {
        return OutputError::UnexpectedElmMakeOutput {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: stderr_str.into_owned(),
        };
    }
    match parse_report(trimmed) {
        Ok(Report::General(general)) => OutputError::ElmMakeGeneralError(general),
        Ok(Report::CompileErrors(errors)) => OutputError::ElmMakeCompileErrors(errors),
        Err(error) => OutputError::ElmMakeJsonParseError { error, raw: trimmed.to_string() },
    }
}

// ============================================================================
// JSON report
// ============================================================================

enum Report {
    General(GeneralError),
    CompileErrors(CompileErrors),
}

fn parse_report(json: &str) -> Result<Report, String> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    match value.get("type").and_then(|t| t.as_str()) {
        Some("error") => serde_json::from_value(value)
            .map(Report::General)
            .map_err(|e| e.to_string()),
        Some("compile-errors") => serde_json::from_value(value)
            .map(Report::CompileErrors)
            .map_err(|e| e.to_string()),
        other => Err(format!("unknown report type: {other:?}")),
    }
}

// ============================================================================
// Dependency install
// ============================================================================

/// Outcome of installing one manifest's dependencies.
#[derive(Debug)]
pub enum InstallOutcome {
    /// Install finished; `output` is the download listing to print (may
    /// be empty when everything was cached).
    Success { output: String },
    /// The manifest itself is broken. Skipped silently; the real compile
    /// will surface the diagnostic with colors.
    ElmJsonError,
    Error(OutputError),
}

/// Install the dependencies of one `elm.json` by compiling a dummy
/// module against it. The compiler downloads missing packages before it
/// even looks at the module.
pub fn install_dependencies(elm_json_path: &Path) -> InstallOutcome {
    let dummy = match write_dummy_module() {
        Ok(dummy) => dummy,
        Err(e) => {
            return InstallOutcome::Error(OutputError::CreatingDummyFailed { error: e.to_string() });
        }
    };

    let result = Cmd::new(ELM_BINARY)
        .arg("make")
        .arg("--report=json")
        .arg("--output=/dev/null")
        .arg(dummy.path())
        .cwd(manifest_dir(elm_json_path))
        .run();

    match result {
        SpawnResult::CommandNotFound => {
            InstallOutcome::Error(OutputError::ElmNotFound { command: ELM_BINARY.to_string() })
        }
        SpawnResult::OtherSpawnError(error) | SpawnResult::StdinWriteError(error) => {
            InstallOutcome::Error(OutputError::OtherSpawnError { error })
        }
        SpawnResult::Exit { reason: ExitReason::ExitCode(0), stdout, .. } => {
            InstallOutcome::Success { output: String::from_utf8_lossy(&stdout).trim().to_string() }
        }
        SpawnResult::Exit { stdout, stderr, .. } => classify_install_failure(&stdout, &stderr),
    }
}

fn classify_install_failure(stdout: &[u8], stderr: &[u8]) -> InstallOutcome {
    let stderr_str = String::from_utf8_lossy(stderr);
    let trimmed = stderr_str.trim();
    if !trimmed.starts_with('{') {
        return InstallOutcome::Error(OutputError::UnexpectedElmInstallOutput {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: stderr_str.into_owned(),
        });
    }
    match parse_report(trimmed) {
        // A report about the manifest itself: leave it for the real compile.
        Ok(Report::General(general)) if is_manifest_report(&general) => InstallOutcome::ElmJsonError,
        Ok(Report::General(general)) => InstallOutcome::Error(OutputError::ElmInstallError {
            title: general.title,
            message: plain_message(&general.message),
        }),
        // The dummy module cannot have compile errors; deps were installed.
        Ok(Report::CompileErrors(_)) => InstallOutcome::Success { output: String::new() },
        Err(_) => InstallOutcome::Error(OutputError::UnexpectedElmInstallOutput {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: trimmed.to_string(),
        }),
    }
}

fn is_manifest_report(general: &GeneralError) -> bool {
    general
        .path
        .as_deref()
        .is_some_and(|p| Path::new(p).file_name().is_some_and(|n| n == "elm.json"))
}

fn plain_message(chunks: &[crate::errors::MessageChunk]) -> String {
    chunks
        .iter()
        .map(|c| match c {
            crate::errors::MessageChunk::Plain(s) => s.as_str(),
            crate::errors::MessageChunk::Styled { string, .. } => string.as_str(),
        })
        .collect()
}

struct DummyModule {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl DummyModule {
    fn path(&self) -> &Path {
        &self.path
    }
}

fn write_dummy_module() -> std::io::Result<DummyModule> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Dummy.elm");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(b"module Dummy exposing (dummy)\n\n\ndummy : ()\ndummy =\n    ()\n")?;
    Ok(DummyModule { _dir: dir, path })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_general_report() {
        let json = r#"{"type":"error","path":"elm.json","title":"MISSING DEPENDENCY",
            "message":["I need ", {"bold":true,"underline":false,"color":null,"string":"elm/core"}]}"#;
        match parse_report(json).unwrap() {
            Report::General(general) => {
                assert_eq!(general.title, "MISSING DEPENDENCY");
                assert!(is_manifest_report(&general));
            }
            Report::CompileErrors(_) => panic!("expected general report"),
        }
    }

    #[test]
    fn test_parse_compile_errors_report() {
        let json = r#"{"type":"compile-errors","errors":[{"path":"src/Main.elm","name":"Main",
            "problems":[{"title":"TYPE MISMATCH",
                "region":{"start":{"line":1,"column":1},"end":{"line":1,"column":2}},
                "message":["nope"]}]}]}"#;
        match parse_report(json).unwrap() {
            Report::CompileErrors(errors) => {
                assert_eq!(errors.errors[0].problems[0].title, "TYPE MISMATCH");
            }
            Report::General(_) => panic!("expected compile errors"),
        }
    }

    #[test]
    fn test_unknown_report_type() {
        assert!(parse_report(r#"{"type":"weird"}"#).is_err());
    }

    #[test]
    fn test_classify_non_json_stderr() {
        let error = classify_make_failure(b"", b"segfault, probably");
        assert!(matches!(error, OutputError::UnexpectedElmMakeOutput { .. }));
    }

    #[test]
    fn test_classify_bad_json_stderr() {
        let error = classify_make_failure(b"", b"{not json");
        assert!(matches!(error, OutputError::ElmMakeJsonParseError { .. }));
    }

    #[test]
    fn test_install_manifest_report_is_skipped() {
        let stderr = br#"{"type":"error","path":"elm.json","title":"BAD JSON","message":["broken"]}"#;
        assert!(matches!(classify_install_failure(b"", stderr), InstallOutcome::ElmJsonError));
    }

    #[test]
    fn test_install_other_report_is_error() {
        let stderr =
            br#"{"type":"error","path":null,"title":"CORRUPT CACHE","message":["bad bytes"]}"#;
        match classify_install_failure(b"", stderr) {
            InstallOutcome::Error(OutputError::ElmInstallError { title, message }) => {
                assert_eq!(title, "CORRUPT CACHE");
                assert_eq!(message, "bad bytes");
            }
            other => panic!("expected install error, got {other:?}"),
        }
    }

    #[test]
    fn test_dummy_module_is_written() {
        let dummy = write_dummy_module().unwrap();
        let contents = std::fs::read_to_string(dummy.path()).unwrap();
        assert!(contents.starts_with("module Dummy"));
    }
}
