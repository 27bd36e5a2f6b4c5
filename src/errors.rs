//! Error taxonomy and terminal rendering.
//!
//! Errors are tagged values, never exceptions: configuration problems
//! become [`ConfigError`]s collected by the loader, per-target failures
//! become [`OutputError`]s stored on the target's status and reported
//! after the batch. Only rendering happens here; nothing in this module
//! aborts the program.

use std::path::PathBuf;

use owo_colors::OwoColorize;
use serde::Deserialize;

use crate::logger;

// ============================================================================
// Configuration errors
// ============================================================================

/// Errors detected while resolving `elm-watch.json` into a project.
#[derive(Debug, Clone)]
pub enum ConfigError {
    ElmJsonNotFound { inputs: Vec<PathBuf> },
    NonUniqueElmJsonPaths { paths: Vec<PathBuf> },
    InputsNotFound { inputs: Vec<PathBuf> },
    InputsFailedToResolve { inputs: Vec<(PathBuf, String)> },
    DuplicateInputs { duplicates: Vec<PathBuf> },
}

// ============================================================================
// Per-target errors
// ============================================================================

/// Everything that can go wrong for one target during a compile cycle.
///
/// Stored on the target's `Status`; rendered and printed after the batch.
#[derive(Debug)]
pub enum OutputError {
    // Compile launch
    ElmNotFound { command: String },
    CommandNotFound { command: String },
    OtherSpawnError { error: String },
    // Compile result
    UnexpectedElmMakeOutput { stdout: String, stderr: String },
    ElmMakeJsonParseError { error: String, raw: String },
    ElmMakeGeneralError(GeneralError),
    ElmMakeCompileErrors(CompileErrors),
    StdoutDecodeError { error: String },
    // Install
    CreatingDummyFailed { error: String },
    ElmInstallError { title: String, message: String },
    UnexpectedElmInstallOutput { stdout: String, stderr: String },
    // Postprocess (external executable)
    PostprocessNonZeroExit { command: String, exit: String, stderr: String },
    PostprocessStdinWriteError { command: String, error: String },
    // Postprocess (elm-watch-node worker)
    ElmWatchNodeMissingScript,
    ElmWatchNodeImportError { script: String, error: String },
    ElmWatchNodeDefaultExportNotFunction { script: String, typeof_default: String },
    ElmWatchNodeRunError { script: String, args: Vec<String>, error: String },
    ElmWatchNodeBadReturnValue { script: String, returned: String },
    WorkerProtocolDecodeError { error: String },
}

// ============================================================================
// Compiler JSON report
// ============================================================================

/// `{"type":"error", ...}` from the compiler's `--report=json`.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralError {
    pub path: Option<String>,
    pub title: String,
    pub message: Vec<MessageChunk>,
}

/// `{"type":"compile-errors", ...}` from the compiler's `--report=json`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompileErrors {
    pub errors: Vec<ProblemFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProblemFile {
    pub path: String,
    pub problems: Vec<Problem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Problem {
    pub title: String,
    pub region: Region,
    pub message: Vec<MessageChunk>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    pub start: Position,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// One piece of a styled compiler message: plain text or a styled span.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageChunk {
    Plain(String),
    Styled {
        bold: bool,
        underline: bool,
        color: Option<String>,
        string: String,
    },
}

impl MessageChunk {
    fn render(&self, fancy: bool) -> String {
        match self {
            Self::Plain(s) => s.clone(),
            Self::Styled { string, color, bold, underline } => {
                if !fancy {
                    return string.clone();
                }
                let mut out = match color.as_deref() {
                    Some("RED" | "red") => string.red().to_string(),
                    Some("GREEN" | "green") => string.green().to_string(),
                    Some("YELLOW" | "yellow") => string.yellow().to_string(),
                    Some("CYAN" | "cyan") => string.cyan().to_string(),
                    _ => string.clone(),
                };
                if *bold {
                    out = out.bold().to_string();
                }
                if *underline {
                    out = out.underline().to_string();
                }
                out
            }
        }
    }
}

fn render_chunks(chunks: &[MessageChunk], fancy: bool) -> String {
    chunks.iter().map(|c| c.render(fancy)).collect()
}

// ============================================================================
// Rendering
// ============================================================================

const HEADER_WIDTH: usize = 80;

/// `-- TITLE ----------------------- location` in the compiler's manner.
fn header(title: &str, location: &str, fancy: bool) -> String {
    let width = logger::terminal_width().map(usize::from).unwrap_or(HEADER_WIDTH);
    let used = 3 + title.len() + 1 + location.len();
    let dashes = width.saturating_sub(used).max(2);
    let line = format!("-- {title} {} {location}", "-".repeat(dashes));
    if fancy { line.cyan().to_string() } else { line }
}

/// Render a configuration error for its attached output.
pub fn render_config_error(output_name: &str, error: &ConfigError, fancy: bool) -> String {
    let list = |paths: &[PathBuf]| {
        paths
            .iter()
            .map(|p| format!("  {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    match error {
        ConfigError::ElmJsonNotFound { inputs } => format!(
            "{}\nNo elm.json found for these inputs:\n{}",
            header("ELM JSON NOT FOUND", output_name, fancy),
            list(inputs),
        ),
        ConfigError::NonUniqueElmJsonPaths { paths } => format!(
            "{}\nThe inputs of this target belong to different elm.json files:\n{}\n\nAll inputs of a target must share one elm.json.",
            header("NO UNIQUE ELM JSON", output_name, fancy),
            list(paths),
        ),
        ConfigError::InputsNotFound { inputs } => format!(
            "{}\nThese inputs do not exist:\n{}",
            header("INPUTS NOT FOUND", output_name, fancy),
            list(inputs),
        ),
        ConfigError::InputsFailedToResolve { inputs } => format!(
            "{}\nThese inputs could not be resolved:\n{}",
            header("INPUTS FAILED TO RESOLVE", output_name, fancy),
            inputs
                .iter()
                .map(|(p, e)| format!("  {}: {}", p.display(), e))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        ConfigError::DuplicateInputs { duplicates } => format!(
            "{}\nThese inputs are listed more than once:\n{}",
            header("DUPLICATE INPUTS", output_name, fancy),
            list(duplicates),
        ),
    }
}

/// Render a per-target error report.
pub fn render_output_error(output_name: &str, error: &OutputError, fancy: bool) -> String {
    match error {
        OutputError::ElmNotFound { command } => format!(
            "{}\nI tried to execute `{command}`, but it was not found on PATH.\nIs the compiler installed?",
            header("ELM NOT FOUND", output_name, fancy),
        ),
        OutputError::CommandNotFound { command } => format!(
            "{}\nThe postprocess command `{command}` was not found on PATH.",
            header("COMMAND NOT FOUND", output_name, fancy),
        ),
        OutputError::OtherSpawnError { error } => format!(
            "{}\nFailed to start the process:\n{error}",
            header("SPAWN ERROR", output_name, fancy),
        ),
        OutputError::UnexpectedElmMakeOutput { stdout, stderr } => format!(
            "{}\nThe compiler printed something unexpected:\nstdout:\n{stdout}\nstderr:\n{stderr}",
            header("UNEXPECTED ELM OUTPUT", output_name, fancy),
        ),
        OutputError::ElmMakeJsonParseError { error, raw } => format!(
            "{}\nFailed to parse the compiler's error report as JSON:\n{error}\n\n{raw}",
            header("TROUBLE WITH JSON REPORT", output_name, fancy),
        ),
        OutputError::ElmMakeGeneralError(general) => {
            let location = general.path.as_deref().unwrap_or(output_name);
            format!(
                "{}\n{}",
                header(&general.title.to_uppercase(), location, fancy),
                render_chunks(&general.message, fancy),
            )
        }
        OutputError::ElmMakeCompileErrors(compile) => compile
            .errors
            .iter()
            .flat_map(|file| {
                file.problems.iter().map(|problem| {
                    format!(
                        "{}\n{}",
                        header(
                            &problem.title,
                            &format!("{}:{}:{}", file.path, problem.region.start.line, problem.region.start.column),
                            fancy,
                        ),
                        render_chunks(&problem.message, fancy),
                    )
                })
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
        OutputError::StdoutDecodeError { error } => format!(
            "{}\nCould not decode the compiled output:\n{error}",
            header("STDOUT DECODE ERROR", output_name, fancy),
        ),
        OutputError::CreatingDummyFailed { error } => format!(
            "{}\nFailed to create a dummy module for dependency install:\n{error}",
            header("CREATING DUMMY FAILED", output_name, fancy),
        ),
        OutputError::ElmInstallError { title, message } => format!(
            "{}\n{message}",
            header(&title.to_uppercase(), output_name, fancy),
        ),
        OutputError::UnexpectedElmInstallOutput { stdout, stderr } => format!(
            "{}\nDependency install printed something unexpected:\nstdout:\n{stdout}\nstderr:\n{stderr}",
            header("UNEXPECTED ELM INSTALL OUTPUT", output_name, fancy),
        ),
        OutputError::PostprocessNonZeroExit { command, exit, stderr } => format!(
            "{}\n`{command}` exited with {exit}.\n{stderr}",
            header("POSTPROCESS ERROR", output_name, fancy),
        ),
        OutputError::PostprocessStdinWriteError { command, error } => format!(
            "{}\nFailed to write the compiled code to `{command}`:\n{error}",
            header("POSTPROCESS STDIN ERROR", output_name, fancy),
        ),
        OutputError::ElmWatchNodeMissingScript => format!(
            "{}\nThe postprocess command is `elm-watch-node` with no script.\nAdd the path to a script as the next array element.",
            header("MISSING POSTPROCESS SCRIPT", output_name, fancy),
        ),
        OutputError::ElmWatchNodeImportError { script, error } => format!(
            "{}\nFailed to import `{script}`:\n{error}",
            header("POSTPROCESS IMPORT ERROR", output_name, fancy),
        ),
        OutputError::ElmWatchNodeDefaultExportNotFunction { script, typeof_default } => format!(
            "{}\nThe default export of `{script}` is not a function.\nIt is: {typeof_default}",
            header("MISSING POSTPROCESS DEFAULT EXPORT", output_name, fancy),
        ),
        OutputError::ElmWatchNodeRunError { script, args, error } => format!(
            "{}\n`{script}` threw when called with {args:?}:\n{error}",
            header("POSTPROCESS RUN ERROR", output_name, fancy),
        ),
        OutputError::ElmWatchNodeBadReturnValue { script, returned } => format!(
            "{}\n`{script}` must return a string, but returned:\n{returned}",
            header("INVALID POSTPROCESS RESULT", output_name, fancy),
        ),
        OutputError::WorkerProtocolDecodeError { error } => format!(
            "{}\nCould not decode the postprocess worker's reply:\n{error}",
            header("POSTPROCESS WORKER ERROR", output_name, fancy),
        ),
    }
}

/// Deduplicate rendered reports by their full text, preserving order.
///
/// Several targets sharing an input produce identical reports; the count
/// printed at the end is the deduplicated one.
pub fn dedup_rendered(rendered: Vec<String>) -> Vec<String> {
    let mut seen = rustc_hash::FxHashSet::default();
    rendered.into_iter().filter(|r| seen.insert(r.clone())).collect()
}

/// The `N errors found` trailer.
pub fn error_count_line(count: usize, fancy: bool) -> String {
    let noun = if count == 1 { "error" } else { "errors" };
    let line = format!("{count} {noun} found");
    if fancy { line.red().bold().to_string() } else { line }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_preserves_order() {
        let rendered = vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string(),
        ];
        assert_eq!(dedup_rendered(rendered), ["b", "a", "c"]);
    }

    #[test]
    fn test_error_count_line() {
        assert_eq!(error_count_line(1, false), "1 error found");
        assert_eq!(error_count_line(3, false), "3 errors found");
    }

    #[test]
    fn test_message_chunk_untagged_decode() {
        let chunks: Vec<MessageChunk> = serde_json::from_str(
            r#"["I cannot find ", {"bold":false,"underline":false,"color":"RED","string":"`x`"}, "."]"#,
        )
        .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(render_chunks(&chunks, false), "I cannot find `x`.");
    }

    #[test]
    fn test_compile_errors_decode() {
        let report: CompileErrors = serde_json::from_str(
            r#"{"errors":[{"path":"src/Main.elm","name":"Main","problems":[
                {"title":"NAMING ERROR",
                 "region":{"start":{"line":3,"column":5},"end":{"line":3,"column":6}},
                 "message":["oops"]}]}]}"#,
        )
        .unwrap();
        assert_eq!(report.errors[0].problems[0].title, "NAMING ERROR");
        assert_eq!(report.errors[0].problems[0].region.start.line, 3);
    }

    #[test]
    fn test_render_plain_has_header() {
        let rendered = render_output_error(
            "build/main.js",
            &OutputError::ElmNotFound { command: "elm".into() },
            false,
        );
        assert!(rendered.starts_with("-- ELM NOT FOUND"));
        assert!(rendered.contains("build/main.js"));
    }
}
