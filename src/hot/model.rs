//! Hot-mode state machine.
//!
//! A pure `update(project, model, msg)` folds filesystem events,
//! WebSocket events, and compilation completions into a [`Model`] and a
//! list of [`Cmd`]s. Side effects live in the run loop's command
//! handlers, which post completion messages back onto the queue.
//!
//! Messages carry their timestamps and any context the handlers
//! enriched them with, so the whole state machine runs deterministically
//! under test.

use std::path::{Path, PathBuf};

use crate::compile::{self, Applied, CompilationPart, PrioritizedOutputs};
use crate::project::{CompilationMode, Project, Status};
use crate::watcher::WatcherEventName;
use crate::ws::protocol::{
    ClientMessage, ClientMessageError, ClientStatus, ConnectError, parse_client_message,
    parse_connect_url,
};
use crate::ws::{SocketId, WsData};

/// Debounce window between a watcher event and acting on it. Coalesces
/// editor "save all", `git switch`, and bulk renames into one rebuild.
pub const DEBOUNCE_MS: u64 = 10;

// ============================================================================
// Events (informational, for timeline printing)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WatcherEvent { date: u64, event_name: WatcherEventName, path: PathBuf },
    WebSocketConnectedEvent { date: u64, output: String },
}

/// A restart trigger plus its human-readable reason.
pub type ReasonedEvent = (String, Event);

// ============================================================================
// Model
// ============================================================================

/// Intent accumulated during the debounce window, drained by the
/// next-action tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum NextAction {
    #[default]
    NoAction,
    PrintNonInterestingEvents(Vec<Event>),
    Compile(Vec<Event>),
    Restart(Vec<ReasonedEvent>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum HotState {
    Idle,
    Dependencies { start: u64, events: Vec<Event> },
    Compiling { start: u64, events: Vec<Event> },
    Restarting { events: Vec<ReasonedEvent> },
}

#[derive(Debug)]
pub struct Model {
    pub next_action: NextAction,
    pub hot_state: HotState,
}

impl Model {
    /// Fresh model at run start: install dependencies first, compiles
    /// wait behind that barrier.
    pub fn initial(start: u64) -> (Self, Vec<Cmd>) {
        (
            Self {
                next_action: NextAction::NoAction,
                hot_state: HotState::Dependencies { start, events: Vec::new() },
            },
            vec![Cmd::InstallDependencies],
        )
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum Msg {
    GotWatcherEvent {
        date: u64,
        event_name: WatcherEventName,
        path: PathBuf,
    },
    SleepBeforeNextActionDone {
        date: u64,
    },
    CompilationPartDone {
        date: u64,
        prioritized_outputs: PrioritizedOutputs,
        part: CompilationPart,
    },
    InstallDependenciesDone {
        date: u64,
        success: bool,
    },
    WebSocketConnected {
        date: u64,
        id: SocketId,
        url: String,
    },
    WebSocketMessageReceived {
        id: SocketId,
        data: WsData,
        /// Original output the socket attached to; `None` for error
        /// sentinels. Enriched by the run loop from the connection list.
        output: Option<String>,
    },
    WebSocketClosed {
        id: SocketId,
    },
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug)]
pub enum Cmd {
    /// (Re)arm the debounce timer.
    SleepBeforeNextAction,
    PrintEvents(Vec<Event>),
    /// A restart is wanted but work is in flight; tell the user.
    LogRestartPending(Vec<String>),
    InstallDependencies,
    /// Claim and dispatch the next batch of actions. `None` means
    /// compute priorities from the live connection list.
    CompileAllOutputs { prioritized: Option<PrioritizedOutputs> },
    /// Batch finished: print timeline, per-target results, and errors.
    CompileSummary { start: u64, events: Vec<Event> },
    AddConnection { id: SocketId, date: u64, output: Result<String, ConnectError> },
    RemoveConnection { id: SocketId },
    SendToClient { id: SocketId, status: ClientStatus },
    /// Push a status to every client attached to `output`.
    NotifyTarget { output: String, status: ClientStatus },
    PersistState,
    ClearScreen,
    Restart { events: Vec<ReasonedEvent> },
    /// Everything is done; consult the on-idle callback.
    HandleIdle,
}

// ============================================================================
// Update
// ============================================================================

pub fn update(project: &mut Project, mut model: Model, msg: Msg) -> (Model, Vec<Cmd>) {
    match msg {
        Msg::GotWatcherEvent { date, event_name, path } => {
            let event = Event::WatcherEvent { date, event_name, path: path.clone() };
            match classify_watcher_event(project, event_name, &path) {
                Classification::Restart(reason) => {
                    model.next_action = merge_restart(model.next_action, reason, event);
                    (model, vec![Cmd::SleepBeforeNextAction])
                }
                Classification::CompileAffected => {
                    model.next_action = merge_compile(model.next_action, event);
                    (model, vec![Cmd::SleepBeforeNextAction])
                }
                Classification::NotInteresting => {
                    model.next_action = merge_not_interesting(model.next_action, event);
                    (model, vec![Cmd::SleepBeforeNextAction])
                }
                Classification::Ignore => (model, Vec::new()),
            }
        }

        Msg::SleepBeforeNextActionDone { date } => {
            let next_action = std::mem::take(&mut model.next_action);
            consume_next_action(project, model, next_action, date)
        }

        Msg::InstallDependenciesDone { success, .. } => {
            match std::mem::replace(&mut model.hot_state, HotState::Idle) {
                // Nothing was executing yet; restart right away
                HotState::Restarting { events } => (model, vec![Cmd::Restart { events }]),
                HotState::Dependencies { start, events } if success => {
                    model.hot_state = HotState::Compiling { start, events };
                    (model, vec![Cmd::CompileAllOutputs { prioritized: None }])
                }
                // Install failed: sit idle until a change triggers a
                // restart or another attempt
                _ => (model, vec![Cmd::HandleIdle]),
            }
        }

        Msg::CompilationPartDone { date, prioritized_outputs, part } => {
            let output = part.output.original().to_string();
            let applied = compile::apply_outcome(project, part, date);
            let mut cmds = Vec::new();
            match applied {
                Applied::Succeeded => cmds.push(Cmd::NotifyTarget {
                    output,
                    status: ClientStatus::SuccessfullyCompiled,
                }),
                Applied::Errored => {
                    cmds.push(Cmd::NotifyTarget { output, status: ClientStatus::CompileError });
                }
                Applied::QueuedPostprocess | Applied::Discarded | Applied::Unknown => {}
            }

            match &mut model.hot_state {
                HotState::Restarting { events } => {
                    if project.num_executing() == 0 {
                        let events = std::mem::take(events);
                        cmds.push(Cmd::Restart { events });
                    }
                    (model, cmds)
                }
                HotState::Compiling { start, events } => {
                    if project.any_pending() {
                        cmds.push(Cmd::CompileAllOutputs { prioritized: Some(prioritized_outputs) });
                        (model, cmds)
                    } else if project.num_executing() == 0 {
                        let start = *start;
                        let events = std::mem::take(events);
                        model.hot_state = HotState::Idle;
                        cmds.push(Cmd::CompileSummary { start, events });
                        cmds.push(Cmd::PersistState);
                        cmds.push(Cmd::HandleIdle);
                        (model, cmds)
                    } else {
                        (model, cmds)
                    }
                }
                HotState::Idle | HotState::Dependencies { .. } => (model, cmds),
            }
        }

        Msg::WebSocketConnected { date, id, url } => on_web_socket_connected(project, model, date, id, &url),

        Msg::WebSocketMessageReceived { id, data, output } => {
            on_web_socket_message(project, model, id, &data, output)
        }

        Msg::WebSocketClosed { id } => (model, vec![Cmd::RemoveConnection { id }]),
    }
}

// ============================================================================
// Watcher event classification
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Classification {
    Restart(String),
    CompileAffected,
    NotInteresting,
    Ignore,
}

fn classify_watcher_event(
    project: &mut Project,
    event_name: WatcherEventName,
    path: &Path,
) -> Classification {
    if path.extension().is_some_and(|ext| ext == "elm") {
        return classify_elm_file(project, event_name, path);
    }

    match path.file_name().and_then(|n| n.to_str()) {
        Some("elm-watch.json" | "elm.json" | "elm-tooling.json") => {
            match event_name {
                // A new config-like file can change input resolution
                WatcherEventName::Added => {
                    Classification::Restart(format!("{} was added", path.display()))
                }
                WatcherEventName::Changed | WatcherEventName::Removed => {
                    if path == project.config_path || project.owns_elm_json(path) {
                        Classification::Restart(format!(
                            "{} was {}",
                            path.display(),
                            event_name.as_str()
                        ))
                    } else {
                        Classification::NotInteresting
                    }
                }
            }
        }
        _ => Classification::Ignore,
    }
}

fn classify_elm_file(
    project: &mut Project,
    event_name: WatcherEventName,
    path: &Path,
) -> Classification {
    // A file referenced by a configuration error: retrying resolution
    // needs a fresh project
    if project
        .elm_json_errors
        .iter()
        .any(|entry| entry.related_paths.iter().any(|p| p == path))
    {
        return Classification::Restart(format!(
            "{} is related to a configuration error",
            path.display()
        ));
    }

    if event_name == WatcherEventName::Removed
        && project.outputs().any(|(_, _, state)| state.inputs.iter().any(|i| i == path))
    {
        return Classification::Restart(format!("the input {} was removed", path.display()));
    }

    let mut affected = false;
    for (_, _, state) in project.outputs_mut() {
        if state.all_related_elm_file_paths.contains(path) {
            state.dirty = true;
            affected = true;
        }
    }
    if affected { Classification::CompileAffected } else { Classification::NotInteresting }
}

// ============================================================================
// Next-action accumulation
// ============================================================================

fn merge_not_interesting(next: NextAction, event: Event) -> NextAction {
    match next {
        NextAction::NoAction => NextAction::PrintNonInterestingEvents(vec![event]),
        NextAction::PrintNonInterestingEvents(mut events) => {
            events.push(event);
            NextAction::PrintNonInterestingEvents(events)
        }
        NextAction::Compile(mut events) => {
            events.push(event);
            NextAction::Compile(events)
        }
        NextAction::Restart(mut events) => {
            events.push((String::new(), event));
            NextAction::Restart(events)
        }
    }
}

fn merge_compile(next: NextAction, event: Event) -> NextAction {
    match next {
        NextAction::NoAction => NextAction::Compile(vec![event]),
        NextAction::PrintNonInterestingEvents(mut events) | NextAction::Compile(mut events) => {
            events.push(event);
            NextAction::Compile(events)
        }
        NextAction::Restart(mut events) => {
            events.push((String::new(), event));
            NextAction::Restart(events)
        }
    }
}

fn merge_restart(next: NextAction, reason: String, event: Event) -> NextAction {
    match next {
        NextAction::NoAction => NextAction::Restart(vec![(reason, event)]),
        NextAction::PrintNonInterestingEvents(events) | NextAction::Compile(events) => {
            let mut reasoned: Vec<ReasonedEvent> =
                events.into_iter().map(|e| (String::new(), e)).collect();
            reasoned.push((reason, event));
            NextAction::Restart(reasoned)
        }
        NextAction::Restart(mut events) => {
            events.push((reason, event));
            NextAction::Restart(events)
        }
    }
}

fn consume_next_action(
    project: &mut Project,
    mut model: Model,
    next_action: NextAction,
    date: u64,
) -> (Model, Vec<Cmd>) {
    match next_action {
        NextAction::NoAction => (model, Vec::new()),
        NextAction::PrintNonInterestingEvents(events) => (model, vec![Cmd::PrintEvents(events)]),
        NextAction::Compile(mut new_events) => match &mut model.hot_state {
            HotState::Idle => {
                // A compile intent can be stale (the work was claimed by
                // an earlier cycle); entering Compiling with nothing
                // pending would never see a completion
                if !project.any_pending() {
                    return (model, vec![Cmd::PrintEvents(new_events)]);
                }
                model.hot_state = HotState::Compiling { start: date, events: new_events };
                (model, vec![Cmd::CompileAllOutputs { prioritized: None }])
            }
            HotState::Compiling { events, .. } => {
                events.append(&mut new_events);
                (model, vec![Cmd::CompileAllOutputs { prioritized: None }])
            }
            // Compiles wait behind the install barrier
            HotState::Dependencies { events, .. } => {
                events.append(&mut new_events);
                (model, Vec::new())
            }
            HotState::Restarting { events } => {
                events.extend(new_events.into_iter().map(|e| (String::new(), e)));
                (model, Vec::new())
            }
        },
        NextAction::Restart(mut new_events) => match &mut model.hot_state {
            HotState::Idle => (model, vec![Cmd::ClearScreen, Cmd::Restart { events: new_events }]),
            HotState::Dependencies { .. } | HotState::Compiling { .. } => {
                let reasons: Vec<String> =
                    new_events.iter().map(|(r, _)| r.clone()).filter(|r| !r.is_empty()).collect();
                // Interrupt in-flight work; results will be discarded
                // when their completions arrive
                for (_, _, state) in project.outputs_mut() {
                    state.dirty = true;
                }
                model.hot_state = HotState::Restarting { events: std::mem::take(&mut new_events) };
                (model, vec![Cmd::LogRestartPending(reasons)])
            }
            HotState::Restarting { events } => {
                events.append(&mut new_events);
                (model, Vec::new())
            }
        },
    }
}

// ============================================================================
// WebSocket messages
// ============================================================================

fn on_web_socket_connected(
    project: &mut Project,
    mut model: Model,
    date: u64,
    id: SocketId,
    url: &str,
) -> (Model, Vec<Cmd>) {
    let params = match parse_connect_url(url) {
        Ok(params) => params,
        Err(error) => return (model, reject_connection(id, date, error)),
    };

    if project.disabled_outputs.contains(&params.output) {
        let error = ConnectError::OutputDisabled {
            output: params.output,
            enabled: project.enabled_originals(),
        };
        return (model, reject_connection(id, date, error));
    }

    let enabled = project.enabled_originals();
    let disabled: Vec<String> = project.disabled_outputs.iter().cloned().collect();
    let Some((_, output, state)) = project.find_by_original(&params.output) else {
        let error =
            ConnectError::OutputNotFound { output: params.output, enabled, disabled };
        return (model, reject_connection(id, date, error));
    };

    let mut cmds = vec![Cmd::AddConnection { id, date, output: Ok(params.output.clone()) }];

    // A real output whose buffer is missing (typecheck-only compile, or
    // nothing compiled yet) must be rebuilt now that a client wants it
    let needs_artifact = !output.is_null()
        && match &state.status {
            Status::Success { code, .. } => code.is_empty(),
            Status::Error(_) => false,
            _ => !state.status.is_executing(),
        };

    let status = match &state.status {
        Status::Success { code, .. } if !code.is_empty() => ClientStatus::SuccessfullyCompiled,
        Status::Error(_) => ClientStatus::CompileError,
        _ => ClientStatus::Busy,
    };
    cmds.push(Cmd::SendToClient { id, status });

    if needs_artifact {
        state.dirty = true;
        let event = Event::WebSocketConnectedEvent { date, output: params.output };
        model.next_action = merge_compile(model.next_action, event);
        cmds.push(Cmd::SleepBeforeNextAction);
    }

    (model, cmds)
}

fn reject_connection(id: SocketId, date: u64, error: ConnectError) -> Vec<Cmd> {
    let message = error.message();
    vec![
        Cmd::AddConnection { id, date, output: Err(error) },
        Cmd::SendToClient { id, status: ClientStatus::ClientError { message } },
    ]
}

fn on_web_socket_message(
    project: &mut Project,
    mut model: Model,
    id: SocketId,
    data: &WsData,
    output: Option<String>,
) -> (Model, Vec<Cmd>) {
    let message = match parse_client_message(data) {
        Ok(message) => message,
        Err(ClientMessageError::UnsupportedDataType) => {
            return (
                model,
                vec![Cmd::SendToClient {
                    id,
                    status: ClientStatus::ClientError {
                        message: "only JSON text frames are supported".to_string(),
                    },
                }],
            );
        }
        Err(ClientMessageError::DecodeError(error)) => {
            return (
                model,
                vec![Cmd::SendToClient {
                    id,
                    status: ClientStatus::ClientError {
                        message: format!("failed to decode the message: {error}"),
                    },
                }],
            );
        }
    };

    match message {
        ClientMessage::ChangeCompilationMode { compilation_mode } => {
            let Some(original) = output else {
                return (
                    model,
                    vec![Cmd::SendToClient {
                        id,
                        status: ClientStatus::ClientError {
                            message: "this connection is not attached to a target".to_string(),
                        },
                    }],
                );
            };
            let Some((_, _, state)) = project.find_by_original(&original) else {
                return (model, Vec::new());
            };
            change_compilation_mode(state, compilation_mode);
            // The mode change itself is not a timeline event; the
            // recompile goes through the usual debounce tick
            model.next_action = match model.next_action {
                NextAction::NoAction | NextAction::PrintNonInterestingEvents(_) => {
                    NextAction::Compile(Vec::new())
                }
                other => other,
            };
            (
                model,
                vec![
                    Cmd::PersistState,
                    Cmd::SendToClient { id, status: ClientStatus::Busy },
                    Cmd::SleepBeforeNextAction,
                ],
            )
        }
    }
}

fn change_compilation_mode(state: &mut crate::project::OutputState, mode: CompilationMode) {
    state.compilation_mode = mode;
    state.dirty = true;
}

// ============================================================================
// Helpers for the run loop
// ============================================================================

/// Whether any restart event touches the configuration file itself; if
/// so, the WebSocket server must not be carried across the restart.
pub fn config_file_changed(project: &Project, events: &[ReasonedEvent]) -> bool {
    events.iter().any(|(_, event)| match event {
        Event::WatcherEvent { path, .. } => path == &project.config_path,
        Event::WebSocketConnectedEvent { .. } => false,
    })
}

/// One timeline line per event.
pub fn describe_event(event: &Event) -> String {
    match event {
        Event::WatcherEvent { date, event_name, path } => format!(
            "{} {} {}",
            crate::clock::format_time(*date),
            event_name.as_str(),
            path.display()
        ),
        Event::WebSocketConnectedEvent { date, output } => format!(
            "{} web socket connected for {}",
            crate::clock::format_time(*date),
            output
        ),
    }
}

