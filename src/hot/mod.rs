//! Hot mode: the long-running watch + rebuild + push loop.
//!
//! The orchestrator runs `update` over a single message queue and
//! executes the returned commands here. All mutation of the [`Mutable`]
//! record (socket server, connections, worker pool, persistence) happens
//! inside command handlers; completions of spawned work come back as
//! messages.

pub mod model;


use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use crate::compile::{self, PrioritizedOutputs};
use crate::postprocess::worker::WorkerPool;
use crate::project::{Project, RunMode, Status};
use crate::ws::protocol::{ClientStatus, ServerMessage};
use crate::ws::server::PortChoice;
use crate::ws::{SocketId, WsEvent, WsServer};
use crate::{clock, config, debug, errors, log, logger, persist, watcher};
use model::{Cmd, Event, Model, Msg, ReasonedEvent};

// ============================================================================
// Public types
// ============================================================================

/// Decision of the user-supplied idle callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnIdle {
    KeepGoing,
    Stop,
}

pub type OnIdleCallback = Box<dyn FnMut() -> OnIdle + Send>;

/// One browser client. `output` is `None` for error sentinels (bad URL,
/// wrong version); `priority` is the connect-time timestamp.
#[derive(Debug, Clone)]
pub struct WebSocketConnection {
    pub id: SocketId,
    pub output: Option<String>,
    pub priority: u64,
}

/// Socket server plus its connections, carried across restarts unless
/// the configuration file itself changed.
pub struct WebSocketState {
    pub server: WsServer,
    pub connections: Vec<WebSocketConnection>,
}

/// Why one hot run ended.
pub enum HotRunResult {
    Restart { events: Vec<ReasonedEvent>, web_socket_state: Option<WebSocketState> },
    ExitOnIdle,
}

// ============================================================================
// Shutdown plumbing
// ============================================================================

static SHUTDOWN_NOTIFIER: Mutex<Option<Box<dyn Fn() + Send>>> = Mutex::new(None);

/// Install the global Ctrl+C handler. Call once at program start,
/// before any blocking operations.
pub fn setup_shutdown_handler() -> Result<()> {
    ctrlc::set_handler(|| match &*SHUTDOWN_NOTIFIER.lock() {
        Some(notify) => notify(),
        // Nothing running yet (e.g. during config load)
        None => std::process::exit(130),
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))
}

// ============================================================================
// Top-level driver
// ============================================================================

/// Run hot mode: load the project, run until restart, reload, repeat.
/// Returns the process exit code.
pub fn run_hot(
    config_path: PathBuf,
    enabled: Option<FxHashSet<String>>,
    on_idle: OnIdleCallback,
) -> Result<i32> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut on_idle = on_idle;
        let mut ws_state: Option<WebSocketState> = None;
        loop {
            let mut project = config::load_project(&config_path, enabled.as_ref())?;
            apply_persisted_modes(&mut project);
            match run_once(project, ws_state.take(), &mut on_idle).await? {
                HotRunResult::Restart { events, web_socket_state } => {
                    for (reason, _) in events.iter().filter(|(r, _)| !r.is_empty()) {
                        log!("watch"; "restarting because {}", reason);
                    }
                    ws_state = web_socket_state;
                }
                HotRunResult::ExitOnIdle => return Ok(0),
            }
        }
    })
}

fn apply_persisted_modes(project: &mut Project) {
    if let Some(state) = persist::restore(&project.watch_root) {
        for (_, output, target) in project.outputs_mut() {
            if let Some(mode) = state.mode_for(output.original()) {
                target.compilation_mode = mode;
            }
        }
    }
}

// ============================================================================
// One run (between restarts)
// ============================================================================

enum LoopEvent {
    Msg(Msg),
    /// Watcher failure or unexpected worker messaging error; both
    /// terminate the hot run.
    Fatal(String),
    Shutdown,
}

struct Mutable {
    project: Project,
    ws: Option<WsServer>,
    connections: Vec<WebSocketConnection>,
    pool: Arc<WorkerPool>,
    persist: persist::PersistHandle,
    client_count: Arc<AtomicUsize>,
}

async fn run_once(
    project: Project,
    carried: Option<WebSocketState>,
    on_idle: &mut OnIdleCallback,
) -> Result<HotRunResult> {
    let (tx, mut rx) = unbounded_channel::<LoopEvent>();

    // Ctrl+C routes into this run's queue
    {
        let tx = tx.clone();
        *SHUTDOWN_NOTIFIER.lock() = Some(Box::new(move || {
            let _ = tx.send(LoopEvent::Shutdown);
        }));
    }

    let mut mutable = setup_mutable(project, carried)?;

    {
        let tx = tx.clone();
        mutable.pool.set_on_unexpected_error(move |error| {
            let _ = tx.send(LoopEvent::Fatal(format!("a postprocess worker failed: {error}")));
        });
    }

    // Wire server events into the queue; payload enrichment (connection
    // lookups, priorities) happens at receive time
    if let Some(server) = mutable.ws.as_ref() {
        let tx = tx.clone();
        server.set_dispatch(move |event| {
            let msg = match event {
                WsEvent::Connected { id, url, date } => Msg::WebSocketConnected { date, id, url },
                WsEvent::Message { id, data } => {
                    Msg::WebSocketMessageReceived { id, data, output: None }
                }
                WsEvent::Closed { id } => Msg::WebSocketClosed { id },
            };
            let _ = tx.send(LoopEvent::Msg(msg));
        });
    }

    let _watcher = {
        let event_tx = tx.clone();
        let error_tx = tx.clone();
        watcher::start(
            &mutable.project.watch_root,
            move |event_name, path| {
                let msg = Msg::GotWatcherEvent { date: clock::now_ms(), event_name, path };
                let _ = event_tx.send(LoopEvent::Msg(msg));
            },
            move |error| {
                let _ = error_tx.send(LoopEvent::Fatal(format!("the filesystem watcher failed: {error}")));
            },
        )
        .context("failed to start the filesystem watcher")?
    };

    let debounce_gen = Arc::new(AtomicU64::new(0));
    let (mut model, cmds) = Model::initial(clock::now_ms());
    let mut pending: VecDeque<Cmd> = cmds.into();

    loop {
        while let Some(cmd) = pending.pop_front() {
            if let Some(exit) = handle_cmd(&mut mutable, &tx, &debounce_gen, on_idle, cmd) {
                return Ok(exit);
            }
        }

        let Some(event) = rx.recv().await else {
            bail!("the hot event queue closed unexpectedly");
        };
        match event {
            LoopEvent::Shutdown => {
                log!("watch"; "shutting down...");
                teardown(&mut mutable);
                return Ok(HotRunResult::ExitOnIdle);
            }
            LoopEvent::Fatal(error) => {
                teardown(&mut mutable);
                bail!("{error}");
            }
            LoopEvent::Msg(mut msg) => {
                enrich(&mutable, &mut msg);
                let (next, cmds) = model::update(&mut mutable.project, model, msg);
                model = next;
                pending.extend(cmds);
            }
        }
    }
}

fn setup_mutable(project: Project, carried: Option<WebSocketState>) -> Result<Mutable> {
    let persist_handle = persist::PersistHandle::new(&project.watch_root);

    let (ws, connections) = match carried {
        Some(state) => (state.server, state.connections),
        None => {
            let choice = match persist::restore(&project.watch_root) {
                Some(state) if state.port != 0 => PortChoice::Persisted(state.port),
                _ => match project.port_from_config {
                    Some(port) => PortChoice::FromConfig(port),
                    None => PortChoice::Ephemeral,
                },
            };
            let server = WsServer::start(choice).map_err(|e| anyhow::anyhow!("{e}"))?;
            log!("ws"; "listening on ws://127.0.0.1:{}", server.port());
            (server, Vec::new())
        }
    };

    // Connections surviving a restart may point at targets the new
    // config no longer has
    let mut connections = connections;
    for connection in &mut connections {
        if let Some(output) = &connection.output
            && !project.disabled_outputs.contains(output)
            && !project.outputs().any(|(_, o, _)| o.original() == *output)
        {
            let message = ServerMessage::StatusChanged {
                status: ClientStatus::ClientError {
                    message: format!("the target {output:?} no longer exists"),
                },
            };
            ws.send(connection.id, &message.to_json());
            connection.output = None;
        }
    }

    let client_count = Arc::new(AtomicUsize::new(connections.len()));
    let pool = Arc::new(WorkerPool::new());
    {
        let client_count = Arc::clone(&client_count);
        pool.set_calculate_max(move || client_count.load(Ordering::SeqCst).max(1));
    }

    Ok(Mutable {
        project,
        ws: Some(ws),
        connections,
        pool,
        persist: persist_handle,
        client_count,
    })
}

fn teardown(mutable: &mut Mutable) {
    *SHUTDOWN_NOTIFIER.lock() = None;
    mutable.pool.terminate();
    if let Some(ws) = mutable.ws.take() {
        ws.unset_dispatch();
        ws.close();
    }
}

/// Fill in message fields that need the live mutable state.
fn enrich(mutable: &Mutable, msg: &mut Msg) {
    match msg {
        Msg::CompilationPartDone { prioritized_outputs, .. } => {
            *prioritized_outputs = prioritized(&mutable.connections);
        }
        Msg::WebSocketMessageReceived { id, output, .. } => {
            *output = mutable
                .connections
                .iter()
                .find(|c| c.id == *id)
                .and_then(|c| c.output.clone());
        }
        _ => {}
    }
}

/// Priorities per output: the latest connect-time timestamp wins when
/// several clients watch the same target.
fn prioritized(connections: &[WebSocketConnection]) -> PrioritizedOutputs {
    let mut map = PrioritizedOutputs::default();
    for connection in connections {
        if let Some(output) = &connection.output {
            let entry = map.entry(output.clone()).or_insert(connection.priority);
            *entry = (*entry).max(connection.priority);
        }
    }
    map
}

// ============================================================================
// Command handlers
// ============================================================================

fn handle_cmd(
    mutable: &mut Mutable,
    tx: &UnboundedSender<LoopEvent>,
    debounce_gen: &Arc<AtomicU64>,
    on_idle: &mut OnIdleCallback,
    cmd: Cmd,
) -> Option<HotRunResult> {
    match cmd {
        Cmd::SleepBeforeNextAction => {
            // Each event re-arms the timer; stale generations are dropped
            let generation = debounce_gen.fetch_add(1, Ordering::SeqCst) + 1;
            let debounce_gen = Arc::clone(debounce_gen);
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(model::DEBOUNCE_MS)).await;
                if debounce_gen.load(Ordering::SeqCst) == generation {
                    let msg = Msg::SleepBeforeNextActionDone { date: clock::now_ms() };
                    let _ = tx.send(LoopEvent::Msg(msg));
                }
            });
            None
        }

        Cmd::PrintEvents(events) => {
            for event in &events {
                log!("watch"; "{}", model::describe_event(event));
            }
            None
        }

        Cmd::LogRestartPending(reasons) => {
            log!("watch"; "restarting when the current compilation is done ({})", reasons.join(", "));
            None
        }

        Cmd::InstallDependencies => {
            let paths: Vec<PathBuf> =
                mutable.project.elm_jsons.iter().map(|e| e.path.clone()).collect();
            let tx = tx.clone();
            tokio::spawn(async move {
                let success = tokio::task::spawn_blocking(move || {
                    compile::install_dependencies(&paths)
                })
                .await
                .unwrap_or(false);
                let msg = Msg::InstallDependenciesDone { date: clock::now_ms(), success };
                let _ = tx.send(LoopEvent::Msg(msg));
            });
            None
        }

        Cmd::CompileAllOutputs { prioritized: given } => {
            let prioritized_outputs = given.unwrap_or_else(|| prioritized(&mutable.connections));
            let actions = compile::get_output_actions(
                &mut mutable.project,
                RunMode::Hot,
                true,
                &prioritized_outputs,
            );
            for action in actions.actions {
                notify_target(mutable, action.output.original(), ClientStatus::Busy);
                let job = compile::begin_action(&mut mutable.project, action, RunMode::Hot);
                let pool = Arc::clone(&mutable.pool);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let part =
                        tokio::task::spawn_blocking(move || compile::perform(job, &pool)).await;
                    if let Ok(part) = part {
                        let msg = Msg::CompilationPartDone {
                            date: clock::now_ms(),
                            prioritized_outputs: PrioritizedOutputs::default(),
                            part,
                        };
                        let _ = tx.send(LoopEvent::Msg(msg));
                    }
                });
            }
            logger::status(&render_status_grid(&mutable.project));
            None
        }

        Cmd::CompileSummary { start, events } => {
            print_summary(mutable, start, events);
            None
        }

        Cmd::AddConnection { id, date, output } => {
            mutable.connections.push(WebSocketConnection {
                id,
                output: output.ok(),
                priority: date,
            });
            mutable.client_count.store(mutable.connections.len(), Ordering::SeqCst);
            None
        }

        Cmd::RemoveConnection { id } => {
            mutable.connections.retain(|c| c.id != id);
            mutable.client_count.store(mutable.connections.len(), Ordering::SeqCst);
            // Fewer clients may mean fewer workers
            mutable.pool.limit();
            None
        }

        Cmd::SendToClient { id, status } => {
            send_to(mutable, id, status);
            None
        }

        Cmd::NotifyTarget { output, status } => {
            notify_target(mutable, &output, status);
            None
        }

        Cmd::PersistState => {
            let port = mutable.ws.as_ref().map(|ws| ws.port()).unwrap_or(0);
            let state = persist::PersistedState::from_project(port, &mutable.project);
            mutable.persist.write(&state);
            None
        }

        Cmd::ClearScreen => {
            logger::clear_screen();
            None
        }

        Cmd::Restart { events } => {
            let config_changed = model::config_file_changed(&mutable.project, &events);
            mutable.pool.terminate();
            *SHUTDOWN_NOTIFIER.lock() = None;
            let web_socket_state = match mutable.ws.take() {
                Some(server) => {
                    server.unset_dispatch();
                    if config_changed {
                        server.close();
                        None
                    } else {
                        Some(WebSocketState {
                            server,
                            connections: std::mem::take(&mut mutable.connections),
                        })
                    }
                }
                None => None,
            };
            Some(HotRunResult::Restart { events, web_socket_state })
        }

        Cmd::HandleIdle => match on_idle() {
            OnIdle::KeepGoing => None,
            OnIdle::Stop => {
                teardown(mutable);
                Some(HotRunResult::ExitOnIdle)
            }
        },
    }
}

fn send_to(mutable: &Mutable, id: SocketId, status: ClientStatus) {
    if let Some(ws) = &mutable.ws {
        let message = ServerMessage::StatusChanged { status };
        ws.send(id, &message.to_json());
    }
}

fn notify_target(mutable: &Mutable, output: &str, status: ClientStatus) {
    let Some(ws) = &mutable.ws else { return };
    for connection in &mutable.connections {
        if connection.output.as_deref() == Some(output) {
            let message = ServerMessage::StatusChanged { status: status.clone() };
            ws.send(connection.id, &message.to_json());
        }
    }
}

// ============================================================================
// Terminal output
// ============================================================================

/// One line per target, drawn as a fixed grid so fancy mode can redraw
/// it in place with cursor-relative moves.
fn render_status_grid(project: &Project) -> String {
    let fancy = logger::fancy();
    let mut lines = Vec::new();
    for (_, output, state) in project.outputs() {
        let (icon, word) = match &state.status {
            Status::NotWrittenToDisk => ("❓", "waiting"),
            Status::QueuedForElmMake | Status::QueuedForPostprocess { .. } => ("⏳", "queued"),
            Status::ElmMake => ("⏳", "compiling"),
            Status::Postprocess => ("⏳", "postprocessing"),
            Status::Interrupted => ("⏸", "interrupted"),
            Status::Success { .. } => ("✅", "success"),
            Status::Error(_) => ("🚨", "error"),
        };
        if fancy {
            lines.push(format!("{icon} {}", output.original()));
        } else {
            lines.push(format!("{}: {word}", output.original()));
        }
    }
    lines.join("\n")
}

fn print_summary(mutable: &mut Mutable, start: u64, events: Vec<Event>) {
    let fancy = logger::fancy();
    logger::status(&render_status_grid(&mutable.project));

    for event in &events {
        log!("watch"; "{}", model::describe_event(event));
    }

    let mut rendered: Vec<String> = mutable
        .project
        .elm_json_errors
        .iter()
        .map(|entry| errors::render_config_error(&entry.output_name, &entry.error, fancy))
        .collect();
    for (_, output, state) in mutable.project.outputs() {
        if let Status::Error(error) = &state.status {
            rendered.push(errors::render_output_error(output.original(), error, fancy));
        }
    }
    let deduped = errors::dedup_rendered(rendered);
    let error_count = deduped.len();
    for report in &deduped {
        logger::line(report);
        logger::line("");
    }
    if error_count > 0 {
        logger::line(&errors::error_count_line(error_count, fancy));
    }

    let duration_ms = clock::now_ms().saturating_sub(start);
    debug!("watch"; "cycle finished in {} ms", duration_ms);

    // Surface the previous persistence failure at this quiet moment
    if let Some(error) = mutable.persist.take_error() {
        log!("watch"; "failed to write the state file: {}", error);
    }
}
