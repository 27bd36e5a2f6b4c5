//! Compile engine.
//!
//! Owns the per-target state transitions (dependency install → compile →
//! postprocess → success/error) and computes which actions may run next
//! under the global concurrency cap, ordered by connected-client
//! priority. The orchestrator claims actions here, performs the blocking
//! work off-thread, and feeds completions back through
//! [`apply_outcome`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::elm::{self, ArtifactMode, InstallOutcome};
use crate::errors::{self, OutputError};
use crate::postprocess::{self, worker::WorkerPool};
use crate::project::{CompilationMode, OutputPath, Project, RunMode, Status};
use crate::{log, logger};

/// Original output path → connect-time priority of the most recent
/// client needing it. Higher runs sooner.
pub type PrioritizedOutputs = FxHashMap<String, u64>;

/// Compile + postprocess actions in flight never exceed this.
pub fn concurrency_cap() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).max(1)
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug)]
pub enum ActionKind {
    Compile { artifact: ArtifactMode },
    Postprocess,
}

/// One claimed unit of work, with everything the blocking task needs
/// snapshotted out of the project.
#[derive(Debug)]
pub struct OutputAction {
    pub elm_json_path: PathBuf,
    pub output: OutputPath,
    pub inputs: Vec<PathBuf>,
    pub mode: CompilationMode,
    pub postprocess: Option<Vec<String>>,
    pub kind: ActionKind,
}

#[derive(Debug)]
pub struct OutputActions {
    pub actions: Vec<OutputAction>,
    /// Enabled targets in total.
    pub total: usize,
    pub num_executing: usize,
    pub num_interrupted: usize,
}

/// Compute and claim the next batch of runnable actions.
///
/// Claimed compile targets move to `QueuedForElmMake`; call
/// [`begin_action`] on each returned action right away.
pub fn get_output_actions(
    project: &mut Project,
    run_mode: RunMode,
    include_interrupted: bool,
    prioritized_outputs: &PrioritizedOutputs,
) -> OutputActions {
    select_actions(project, run_mode, include_interrupted, prioritized_outputs, concurrency_cap())
}

fn select_actions(
    project: &mut Project,
    run_mode: RunMode,
    include_interrupted: bool,
    prioritized_outputs: &PrioritizedOutputs,
    cap: usize,
) -> OutputActions {
    let total = project.outputs().count();
    let num_executing = project.num_executing();
    let num_interrupted = project.num_interrupted();
    let free = cap.max(1).saturating_sub(num_executing);

    // (priority, declaration index) per candidate; higher priority first,
    // declaration order breaks ties (None sorts last).
    let mut candidates: Vec<(Option<u64>, usize, PathBuf, OutputPath)> = Vec::new();
    for (index, (elm_json_path, output, state)) in project.outputs().enumerate() {
        if state.status.is_executing() {
            continue;
        }
        let runnable = match state.status {
            Status::QueuedForPostprocess { .. } => true,
            Status::Interrupted => state.dirty && include_interrupted,
            _ => state.dirty,
        };
        if !runnable {
            continue;
        }
        let priority = prioritized_outputs.get(output.original()).copied();
        candidates.push((priority, index, elm_json_path.to_path_buf(), output.clone()));
    }
    candidates.sort_by(|(pa, ia, ..), (pb, ib, ..)| match (pa, pb) {
        (Some(a), Some(b)) => b.cmp(a).then(ia.cmp(ib)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => ia.cmp(ib),
    });
    candidates.truncate(free);

    let mut actions = Vec::with_capacity(candidates.len());
    for (priority, _, elm_json_path, output) in candidates {
        let original = output.original().to_string();
        let Some((_, _, state)) = project.find_by_original(&original) else {
            continue;
        };
        // A target that went dirty while queued for postprocess
        // relaunches the compile instead
        let kind = match (&state.status, state.dirty) {
            (Status::QueuedForPostprocess { .. }, false) => ActionKind::Postprocess,
            _ => {
                state.status = Status::QueuedForElmMake;
                // Typecheck only when nothing needs the artifact: a null
                // sink always, a real output only while no client is
                // connected for it in hot mode.
                let artifact = if output.is_null()
                    || (run_mode == RunMode::Hot && priority.is_none())
                {
                    ArtifactMode::TypecheckOnly
                } else {
                    ArtifactMode::Full
                };
                ActionKind::Compile { artifact }
            }
        };
        actions.push(OutputAction {
            elm_json_path,
            inputs: state.inputs.clone(),
            mode: state.compilation_mode,
            postprocess: state.postprocess.clone(),
            output,
            kind,
        });
    }

    OutputActions { actions, total, num_executing, num_interrupted }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Everything the blocking task needs; owns the pending code buffer for
/// postprocess actions.
#[derive(Debug)]
pub struct ActionJob {
    pub action: OutputAction,
    pub target_name: String,
    pub run_mode: RunMode,
    pub watch_root: PathBuf,
    /// Compiled bytes for a postprocess action.
    pub code: Option<Vec<u8>>,
}

/// Transition the claimed target into its executing status and build
/// the job for the blocking task. `dirty` clears here, at `ElmMake`
/// entry, so a change arriving mid-compile re-dirties the target and
/// the finished result gets discarded.
pub fn begin_action(project: &mut Project, action: OutputAction, run_mode: RunMode) -> ActionJob {
    let watch_root = project.watch_root.clone();
    let original = action.output.original().to_string();
    let mut code = None;
    if let Some((_, _, state)) = project.find_by_original(&original) {
        match action.kind {
            ActionKind::Compile { .. } => {
                state.dirty = false;
                state.status = Status::ElmMake;
            }
            ActionKind::Postprocess => {
                let previous = std::mem::replace(&mut state.status, Status::Postprocess);
                if let Status::QueuedForPostprocess { code: pending } = previous {
                    code = Some(pending);
                }
            }
        }
    }
    ActionJob { action, target_name: original, run_mode, watch_root, code }
}

/// Result of one performed action.
#[derive(Debug)]
pub enum ActionOutcome {
    /// Terminal success; artifact already written for real outputs.
    /// `code` is empty for typecheck-only compiles.
    Success { code: Vec<u8> },
    /// Compile succeeded and a postprocess is configured.
    NeedsPostprocess { code: Vec<u8> },
    Failed(OutputError),
}

/// Completion of one action, routed back to the orchestrator.
#[derive(Debug)]
pub struct CompilationPart {
    pub elm_json_path: PathBuf,
    pub output: OutputPath,
    pub outcome: ActionOutcome,
}

/// Perform one unit of work. Blocking; run off the orchestrator thread.
pub fn perform(job: ActionJob, pool: &WorkerPool) -> CompilationPart {
    let outcome = match &job.action.kind {
        ActionKind::Compile { artifact } => {
            match elm::make(&job.action.elm_json_path, &job.action.inputs, job.action.mode, *artifact) {
                Err(error) => ActionOutcome::Failed(error),
                // A typecheck leaves any previously written artifact alone
                Ok(compiled) if *artifact == ArtifactMode::TypecheckOnly => {
                    ActionOutcome::Success { code: compiled.code }
                }
                Ok(compiled) if job.action.postprocess.is_some() => {
                    ActionOutcome::NeedsPostprocess { code: compiled.code }
                }
                Ok(compiled) => finish(&job.action.output, compiled.code),
            }
        }
        ActionKind::Postprocess => {
            let command = job.action.postprocess.clone().unwrap_or_default();
            let code = job.code.clone().unwrap_or_default();
            match postprocess::run(
                pool,
                &job.watch_root,
                &command,
                &job.target_name,
                job.action.mode,
                job.run_mode,
                code,
            ) {
                Ok(code) => finish(&job.action.output, code),
                Err(error) => ActionOutcome::Failed(error),
            }
        }
    };
    CompilationPart {
        elm_json_path: job.action.elm_json_path,
        output: job.action.output,
        outcome,
    }
}

/// Write the final bytes to disk for real outputs. The in-memory buffer
/// stays the source of truth either way.
fn finish(output: &OutputPath, code: Vec<u8>) -> ActionOutcome {
    if let OutputPath::Real { absolute, .. } = output {
        if let Some(parent) = absolute.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            return ActionOutcome::Failed(OutputError::OtherSpawnError { error: e.to_string() });
        }
        if let Err(e) = std::fs::write(absolute, &code) {
            return ActionOutcome::Failed(OutputError::OtherSpawnError { error: e.to_string() });
        }
    }
    ActionOutcome::Success { code }
}

// ============================================================================
// Completion
// ============================================================================

/// What happened to the target when a completion was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Succeeded,
    QueuedPostprocess,
    Errored,
    /// The target went dirty again mid-flight; the result was thrown
    /// away and the target re-queues.
    Discarded,
    /// The target is gone (project changed under us).
    Unknown,
}

/// Fold one completion into the project. `date` is the completion
/// timestamp in milliseconds.
pub fn apply_outcome(project: &mut Project, part: CompilationPart, date: u64) -> Applied {
    let original = part.output.original().to_string();
    let Some((_, _, state)) = project.find_by_original(&original) else {
        return Applied::Unknown;
    };

    if state.dirty {
        state.status = Status::Interrupted;
        return Applied::Discarded;
    }

    match part.outcome {
        ActionOutcome::Success { code } => {
            // compiled_timestamp strictly increases across successive
            // successful compiles, even within one millisecond
            let previous = match state.status {
                Status::Success { compiled_timestamp, .. } => compiled_timestamp,
                _ => 0,
            };
            state.status = Status::Success {
                code,
                compiled_timestamp: date.max(previous + 1),
            };
            Applied::Succeeded
        }
        ActionOutcome::NeedsPostprocess { code } => {
            state.status = Status::QueuedForPostprocess { code };
            Applied::QueuedPostprocess
        }
        ActionOutcome::Failed(error) => {
            state.status = Status::Error(error);
            Applied::Errored
        }
    }
}

// ============================================================================
// Dependency install
// ============================================================================

/// Environment variable overriding the delay before the install
/// indicator shows, in milliseconds.
pub const LOADING_MESSAGE_DELAY_VAR: &str = "__ELM_WATCH_LOADING_MESSAGE_DELAY";
const LOADING_MESSAGE_DELAY_MS: u64 = 100;

fn loading_message_delay() -> Duration {
    let ms = std::env::var(LOADING_MESSAGE_DELAY_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LOADING_MESSAGE_DELAY_MS);
    Duration::from_millis(ms)
}

/// Install dependencies for every manifest, strictly in sequence: two
/// concurrent installs may corrupt the shared per-user package cache,
/// and duplicate downloads are wasteful.
///
/// Returns false when any manifest failed; the error has already been
/// printed.
pub fn install_dependencies(elm_json_paths: &[PathBuf]) -> bool {
    for elm_json_path in elm_json_paths {
        let indicator = LoadingIndicator::start(elm_json_path);
        let outcome = elm::install_dependencies(elm_json_path);
        match outcome {
            InstallOutcome::Success { output } => {
                indicator.finish();
                if output.is_empty() {
                    logger::clear_status();
                } else {
                    log!("install"; "{}", output);
                }
                log!("install"; "{}: dependencies ready", elm_json_path.display());
            }
            // The real compile will surface the diagnostic with colors
            InstallOutcome::ElmJsonError => {
                indicator.finish();
                logger::clear_status();
            }
            InstallOutcome::Error(error) => {
                indicator.finish();
                logger::clear_status();
                logger::line(&errors::render_output_error(
                    &elm_json_path.display().to_string(),
                    &error,
                    logger::fancy(),
                ));
                return false;
            }
        }
    }
    true
}

/// Delayed "in progress" line for dependency install. Shown only when
/// the install outlives the delay; drawn as the status block so the
/// next write erases it.
struct LoadingIndicator {
    cancel: crossbeam::channel::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl LoadingIndicator {
    fn start(elm_json_path: &Path) -> Self {
        let (cancel, cancelled) = crossbeam::channel::bounded::<()>(1);
        let display = elm_json_path.display().to_string();
        let delay = loading_message_delay();
        let handle = std::thread::spawn(move || {
            if cancelled.recv_timeout(delay).is_err() {
                let spinner = if logger::fancy() { "⏳ " } else { "" };
                logger::status(&format!("{spinner}{display}: installing dependencies"));
            }
        });
        Self { cancel, handle }
    }

    fn finish(self) {
        let _ = self.cancel.send(());
        let _ = self.handle.join();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ElmJson, OutputState};
    use rustc_hash::FxHashSet;

    fn target(name: &str) -> (OutputPath, OutputState) {
        (
            OutputPath::Real {
                absolute: PathBuf::from(format!("/proj/{name}")),
                original: name.to_string(),
            },
            OutputState::new(vec![PathBuf::from("/proj/src/Main.elm")], None),
        )
    }

    fn project(names: &[&str]) -> Project {
        Project {
            watch_root: PathBuf::from("/proj"),
            config_path: PathBuf::from("/proj/elm-watch.json"),
            port_from_config: None,
            elm_jsons: vec![ElmJson {
                path: PathBuf::from("/proj/elm.json"),
                outputs: names.iter().map(|n| target(n)).collect(),
            }],
            elm_json_errors: Vec::new(),
            disabled_outputs: FxHashSet::default(),
        }
    }

    fn originals(actions: &OutputActions) -> Vec<String> {
        actions.actions.iter().map(|a| a.output.original().to_string()).collect()
    }

    #[test]
    fn test_dirty_targets_become_compile_actions() {
        let mut project = project(&["a.js", "b.js"]);
        let actions = select_actions(&mut project, RunMode::Hot, false, &FxHashMap::default(), 8);
        assert_eq!(originals(&actions), ["a.js", "b.js"]);
        assert_eq!(actions.total, 2);
        assert_eq!(actions.num_executing, 0);
        for (_, _, state) in project.outputs() {
            assert!(matches!(state.status, Status::QueuedForElmMake));
        }
    }

    #[test]
    fn test_cap_limits_batch() {
        let mut project = project(&["a.js", "b.js", "c.js"]);
        let actions = select_actions(&mut project, RunMode::Hot, false, &FxHashMap::default(), 2);
        assert_eq!(actions.actions.len(), 2);
    }

    #[test]
    fn test_executing_counts_against_cap() {
        let mut project = project(&["a.js", "b.js", "c.js"]);
        {
            let (_, _, state) = project.find_by_original("a.js").unwrap();
            state.status = Status::ElmMake;
            state.dirty = false;
        }
        let actions = select_actions(&mut project, RunMode::Hot, false, &FxHashMap::default(), 2);
        assert_eq!(actions.num_executing, 1);
        assert_eq!(actions.actions.len(), 1, "one free slot");
        assert_eq!(originals(&actions), ["b.js"]);
    }

    #[test]
    fn test_client_priority_beats_declaration_order() {
        let mut project = project(&["a.js", "b.js", "c.js"]);
        let mut prioritized = FxHashMap::default();
        prioritized.insert("c.js".to_string(), 2000);
        prioritized.insert("b.js".to_string(), 1000);
        let actions = select_actions(&mut project, RunMode::Hot, false, &prioritized, 8);
        assert_eq!(originals(&actions), ["c.js", "b.js", "a.js"]);
    }

    #[test]
    fn test_no_client_means_typecheck_only_in_hot() {
        let mut project = project(&["a.js"]);
        let actions = select_actions(&mut project, RunMode::Hot, false, &FxHashMap::default(), 8);
        assert!(matches!(
            actions.actions[0].kind,
            ActionKind::Compile { artifact: ArtifactMode::TypecheckOnly }
        ));
    }

    #[test]
    fn test_connected_client_gets_full_artifact() {
        let mut project = project(&["a.js"]);
        let mut prioritized = FxHashMap::default();
        prioritized.insert("a.js".to_string(), 1);
        let actions = select_actions(&mut project, RunMode::Hot, false, &prioritized, 8);
        assert!(matches!(
            actions.actions[0].kind,
            ActionKind::Compile { artifact: ArtifactMode::Full }
        ));
    }

    #[test]
    fn test_make_mode_is_always_full() {
        let mut project = project(&["a.js"]);
        let actions = select_actions(&mut project, RunMode::Make, false, &FxHashMap::default(), 8);
        assert!(matches!(
            actions.actions[0].kind,
            ActionKind::Compile { artifact: ArtifactMode::Full }
        ));
    }

    #[test]
    fn test_interrupted_requires_opt_in() {
        let mut project = project(&["a.js"]);
        {
            let (_, _, state) = project.find_by_original("a.js").unwrap();
            state.status = Status::Interrupted;
        }
        let skipped = select_actions(&mut project, RunMode::Hot, false, &FxHashMap::default(), 8);
        assert!(skipped.actions.is_empty());
        assert_eq!(skipped.num_interrupted, 1);

        let included = select_actions(&mut project, RunMode::Hot, true, &FxHashMap::default(), 8);
        assert_eq!(included.actions.len(), 1);
    }

    #[test]
    fn test_queued_postprocess_becomes_postprocess_action() {
        let mut project = project(&["a.js"]);
        {
            let (_, _, state) = project.find_by_original("a.js").unwrap();
            state.dirty = false;
            state.status = Status::QueuedForPostprocess { code: b"js".to_vec() };
        }
        let actions = select_actions(&mut project, RunMode::Hot, false, &FxHashMap::default(), 8);
        assert_eq!(actions.actions.len(), 1);
        assert!(matches!(actions.actions[0].kind, ActionKind::Postprocess));
    }

    #[test]
    fn test_begin_compile_clears_dirty_at_elm_make_entry() {
        let mut project = project(&["a.js"]);
        let mut actions = select_actions(&mut project, RunMode::Hot, false, &FxHashMap::default(), 8);
        let job = begin_action(&mut project, actions.actions.remove(0), RunMode::Hot);
        assert_eq!(job.target_name, "a.js");
        let (_, _, state) = project.find_by_original("a.js").unwrap();
        assert!(!state.dirty);
        assert!(matches!(state.status, Status::ElmMake));
    }

    #[test]
    fn test_begin_postprocess_takes_code_buffer() {
        let mut project = project(&["a.js"]);
        {
            let (_, _, state) = project.find_by_original("a.js").unwrap();
            state.dirty = false;
            state.status = Status::QueuedForPostprocess { code: b"compiled".to_vec() };
        }
        let mut actions = select_actions(&mut project, RunMode::Hot, false, &FxHashMap::default(), 8);
        let job = begin_action(&mut project, actions.actions.remove(0), RunMode::Hot);
        assert_eq!(job.code.as_deref(), Some(b"compiled".as_slice()));
        let (_, _, state) = project.find_by_original("a.js").unwrap();
        assert!(matches!(state.status, Status::Postprocess));
    }

    #[test]
    fn test_apply_success_sets_timestamp() {
        let mut project = project(&["a.js"]);
        let part = CompilationPart {
            elm_json_path: PathBuf::from("/proj/elm.json"),
            output: OutputPath::Real {
                absolute: PathBuf::from("/proj/a.js"),
                original: "a.js".to_string(),
            },
            outcome: ActionOutcome::Success { code: b"js".to_vec() },
        };
        {
            let (_, _, state) = project.find_by_original("a.js").unwrap();
            state.dirty = false;
            state.status = Status::ElmMake;
        }
        assert_eq!(apply_outcome(&mut project, part, 5000), Applied::Succeeded);
        let (_, _, state) = project.find_by_original("a.js").unwrap();
        match &state.status {
            Status::Success { compiled_timestamp, .. } => assert_eq!(*compiled_timestamp, 5000),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut project = project(&["a.js"]);
        let part = |code: &[u8]| CompilationPart {
            elm_json_path: PathBuf::from("/proj/elm.json"),
            output: OutputPath::Real {
                absolute: PathBuf::from("/proj/a.js"),
                original: "a.js".to_string(),
            },
            outcome: ActionOutcome::Success { code: code.to_vec() },
        };
        {
            let (_, _, state) = project.find_by_original("a.js").unwrap();
            state.dirty = false;
        }
        apply_outcome(&mut project, part(b"one"), 5000);
        // Second compile completes within the same millisecond
        apply_outcome(&mut project, part(b"two"), 5000);
        let (_, _, state) = project.find_by_original("a.js").unwrap();
        match &state.status {
            Status::Success { compiled_timestamp, .. } => assert_eq!(*compiled_timestamp, 5001),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_dirty_at_completion_discards_result() {
        let mut project = project(&["a.js"]);
        {
            let (_, _, state) = project.find_by_original("a.js").unwrap();
            state.status = Status::ElmMake;
            state.dirty = true; // file changed mid-compile
        }
        let part = CompilationPart {
            elm_json_path: PathBuf::from("/proj/elm.json"),
            output: OutputPath::Real {
                absolute: PathBuf::from("/proj/a.js"),
                original: "a.js".to_string(),
            },
            outcome: ActionOutcome::Success { code: b"stale".to_vec() },
        };
        assert_eq!(apply_outcome(&mut project, part, 1), Applied::Discarded);
        let (_, _, state) = project.find_by_original("a.js").unwrap();
        assert!(matches!(state.status, Status::Interrupted));
        assert!(state.dirty, "still needs the rebuild");
    }

    #[test]
    fn test_apply_error() {
        let mut project = project(&["a.js"]);
        {
            let (_, _, state) = project.find_by_original("a.js").unwrap();
            state.dirty = false;
            state.status = Status::ElmMake;
        }
        let part = CompilationPart {
            elm_json_path: PathBuf::from("/proj/elm.json"),
            output: OutputPath::Real {
                absolute: PathBuf::from("/proj/a.js"),
                original: "a.js".to_string(),
            },
            outcome: ActionOutcome::Failed(OutputError::ElmNotFound { command: "elm".into() }),
        };
        assert_eq!(apply_outcome(&mut project, part, 1), Applied::Errored);
    }

    #[test]
    fn test_loading_delay_default() {
        // Guard against env leakage from other tests
        if std::env::var(LOADING_MESSAGE_DELAY_VAR).is_err() {
            assert_eq!(loading_message_delay(), Duration::from_millis(100));
        }
    }
}
