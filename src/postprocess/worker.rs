//! Long-lived postprocess workers.
//!
//! `elm-watch-node` scripts run inside isolated `node` child processes
//! driven by a JSON-lines protocol on stdin/stdout. Workers are created
//! on demand, reused across postprocess calls of the same run, and
//! killed when the pool's cap shrinks below the idle count.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::OutputError;

/// Bootstrap run by each worker via `node -e`. Reads one
/// `StartPostprocess` JSON line per job, imports the user script, calls
/// its default export, and replies with one `PostprocessDone` line. All
/// script failures are classified on the worker side.
const NODE_BOOTSTRAP: &str = r#"
const path = require("path");
const url = require("url");
const readline = require("readline");
const rl = readline.createInterface({ input: process.stdin, terminal: false });
rl.on("line", async (line) => {
  const reply = (result) =>
    process.stdout.write(JSON.stringify({ tag: "PostprocessDone", result }) + "\n");
  const reject = (error) => reply({ tag: "Reject", error });
  let msg;
  try {
    msg = JSON.parse(line);
  } catch (error) {
    return reject({ tag: "ElmWatchNodeRunError", script: "", args: [], error: String(error) });
  }
  if (msg.tag !== "StartPostprocess") {
    return;
  }
  const { cwd, userArgs, extraArgs, code } = msg.args;
  if (userArgs.length === 0) {
    return reject({ tag: "ElmWatchNodeMissingScript" });
  }
  const script = path.resolve(cwd, userArgs[0]);
  let imported;
  try {
    imported = await import(url.pathToFileURL(script).href);
  } catch (error) {
    return reject({ tag: "ElmWatchNodeImportError", script, error: String(error) });
  }
  if (typeof imported.default !== "function") {
    return reject({
      tag: "ElmWatchNodeDefaultExportNotFunction",
      script,
      typeofDefault: typeof imported.default,
    });
  }
  const args = [code, ...userArgs.slice(1), ...extraArgs];
  let returned;
  try {
    returned = await imported.default(...args);
  } catch (error) {
    return reject({
      tag: "ElmWatchNodeRunError",
      script,
      args: args.slice(1),
      error: String((error && error.stack) || error),
    });
  }
  if (typeof returned !== "string") {
    return reject({ tag: "ElmWatchNodeBadReturnValue", script, returned: String(returned) });
  }
  reply({ tag: "Resolve", value: { tag: "Success", code: returned } });
});
"#;

// ============================================================================
// Protocol
// ============================================================================

/// One postprocess job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostprocessRequest {
    pub cwd: String,
    pub user_args: Vec<String>,
    pub extra_args: Vec<String>,
    pub code: String,
}

impl PostprocessRequest {
    fn to_line(&self) -> String {
        #[derive(Serialize)]
        struct Envelope<'a> {
            tag: &'static str,
            args: &'a PostprocessRequest,
        }
        serde_json::to_string(&Envelope { tag: "StartPostprocess", args: self })
            .unwrap_or_default()
    }
}

/// Worker reply, already mapped into the error taxonomy.
#[derive(Debug)]
pub enum PostprocessReply {
    Resolve { code: String },
    Reject(OutputError),
}

/// Decode one `PostprocessDone` line.
fn parse_reply(line: &str) -> PostprocessReply {
    let decode_error = |error: String| {
        PostprocessReply::Reject(OutputError::WorkerProtocolDecodeError { error })
    };
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return decode_error(e.to_string()),
    };
    if value.get("tag").and_then(|t| t.as_str()) != Some("PostprocessDone") {
        return decode_error(format!("unexpected message: {line}"));
    }
    let Some(result) = value.get("result") else {
        return decode_error("missing result".to_string());
    };
    let str_field = |obj: &serde_json::Value, key: &str| {
        obj.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
    };
    match result.get("tag").and_then(|t| t.as_str()) {
        Some("Resolve") => {
            match result.pointer("/value/code").and_then(|c| c.as_str()) {
                Some(code) => PostprocessReply::Resolve { code: code.to_string() },
                None => decode_error("Resolve without a string code".to_string()),
            }
        }
        Some("Reject") => {
            let Some(error) = result.get("error") else {
                return decode_error("Reject without error".to_string());
            };
            let script = str_field(error, "script");
            let reject = match error.get("tag").and_then(|t| t.as_str()) {
                Some("ElmWatchNodeMissingScript") => OutputError::ElmWatchNodeMissingScript,
                Some("ElmWatchNodeImportError") => OutputError::ElmWatchNodeImportError {
                    script,
                    error: str_field(error, "error"),
                },
                Some("ElmWatchNodeDefaultExportNotFunction") => {
                    OutputError::ElmWatchNodeDefaultExportNotFunction {
                        script,
                        typeof_default: str_field(error, "typeofDefault"),
                    }
                }
                Some("ElmWatchNodeRunError") => OutputError::ElmWatchNodeRunError {
                    script,
                    args: error
                        .get("args")
                        .and_then(|a| a.as_array())
                        .map(|a| {
                            a.iter()
                                .map(|v| v.as_str().unwrap_or_default().to_string())
                                .collect()
                        })
                        .unwrap_or_default(),
                    error: str_field(error, "error"),
                },
                Some("ElmWatchNodeBadReturnValue") => OutputError::ElmWatchNodeBadReturnValue {
                    script,
                    returned: str_field(error, "returned"),
                },
                other => {
                    return decode_error(format!("unknown reject tag: {other:?}"));
                }
            };
            PostprocessReply::Reject(reject)
        }
        other => decode_error(format!("unknown result tag: {other:?}")),
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Terminated,
}

type Job = (String, Sender<Result<String, String>>);

/// One child worker process.
///
/// The pool's unexpected-error callback is passed into the constructor,
/// so the worker never names the pool type.
pub struct Worker {
    id: u64,
    status: Mutex<WorkerStatus>,
    jobs: Sender<Job>,
    child: Arc<Mutex<Child>>,
}

impl Worker {
    /// Spawn a `node` worker running the bootstrap.
    pub fn spawn(
        id: u64,
        on_unexpected_error: impl Fn(String) + Send + 'static,
    ) -> Result<Self, OutputError> {
        Self::spawn_program(id, "node", &["-e".to_string(), NODE_BOOTSTRAP.to_string()], on_unexpected_error)
    }

    /// Spawn with an explicit program (the test seam).
    fn spawn_program(
        id: u64,
        program: &str,
        args: &[String],
        on_unexpected_error: impl Fn(String) + Send + 'static,
    ) -> Result<Self, OutputError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    OutputError::CommandNotFound { command: program.to_string() }
                }
                _ => OutputError::OtherSpawnError { error: e.to_string() },
            })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let (jobs, jobs_rx) = channel::unbounded::<Job>();

        // One I/O thread per worker: write a request line, read the reply
        // line, hand it back. A vanished child reports through the
        // unexpected-error callback.
        std::thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            while let Ok((line, reply_tx)) = jobs_rx.recv() {
                let io = write_and_read(&mut stdin, &mut reader, &line);
                if let Err(error) = &io {
                    on_unexpected_error(error.clone());
                }
                let _ = reply_tx.send(io);
            }
        });

        Ok(Self {
            id,
            status: Mutex::new(WorkerStatus::Idle),
            jobs,
            child: Arc::new(Mutex::new(child)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    /// Claim an idle worker for one job. Returns false when the worker
    /// is busy or gone.
    pub(super) fn try_claim(&self) -> bool {
        let mut status = self.status.lock();
        if *status == WorkerStatus::Idle {
            *status = WorkerStatus::Busy;
            true
        } else {
            false
        }
    }

    /// Run one request/response cycle. The worker must have been claimed
    /// first; anything else is a programming error.
    pub fn postprocess(&self, request: &PostprocessRequest) -> PostprocessReply {
        assert_eq!(self.status(), WorkerStatus::Busy, "postprocess on an unclaimed worker");

        let (reply_tx, reply_rx) = channel::bounded(1);
        let reply = if self.jobs.send((request.to_line(), reply_tx)).is_err() {
            Err("worker I/O thread is gone".to_string())
        } else {
            reply_rx.recv().unwrap_or_else(|e| Err(e.to_string()))
        };

        match reply {
            Ok(line) => {
                *self.status.lock() = WorkerStatus::Idle;
                parse_reply(&line)
            }
            Err(error) => {
                *self.status.lock() = WorkerStatus::Terminated;
                PostprocessReply::Reject(OutputError::WorkerProtocolDecodeError { error })
            }
        }
    }

    /// Kill the child. Safe to call in any state.
    pub fn terminate(&self) {
        *self.status.lock() = WorkerStatus::Terminated;
        let _ = self.child.lock().kill();
    }
}

fn write_and_read(
    stdin: &mut impl Write,
    reader: &mut impl BufRead,
    line: &str,
) -> Result<String, String> {
    stdin
        .write_all(line.as_bytes())
        .and_then(|()| stdin.write_all(b"\n"))
        .and_then(|()| stdin.flush())
        .map_err(|e| format!("failed to write to worker: {e}"))?;
    let mut reply = String::new();
    let read = reader
        .read_line(&mut reply)
        .map_err(|e| format!("failed to read from worker: {e}"))?;
    if read == 0 {
        return Err("worker exited unexpectedly".to_string());
    }
    Ok(reply)
}

// ============================================================================
// Pool
// ============================================================================

/// Bounded set of long-lived workers.
pub struct WorkerPool {
    workers: Mutex<Vec<Arc<Worker>>>,
    calculate_max: Mutex<Box<dyn Fn() -> usize + Send>>,
    /// Invoked when a worker dies outside the request protocol. The hot
    /// orchestrator treats that as fatal.
    on_unexpected_error: Mutex<Arc<dyn Fn(String) + Send + Sync>>,
    next_id: Mutex<u64>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            calculate_max: Mutex::new(Box::new(|| 1)),
            on_unexpected_error: Mutex::new(Arc::new(|error| {
                crate::log!("postprocess"; "worker error: {}", error);
            })),
            next_id: Mutex::new(1),
        }
    }

    /// Install the function computing the current worker cap (usually:
    /// number of connected clients, bounded below by one).
    pub fn set_calculate_max(&self, f: impl Fn() -> usize + Send + 'static) {
        *self.calculate_max.lock() = Box::new(f);
    }

    /// Install the unexpected-error callback, applied to workers created
    /// from now on.
    pub fn set_on_unexpected_error(&self, f: impl Fn(String) + Send + Sync + 'static) {
        *self.on_unexpected_error.lock() = Arc::new(f);
    }

    /// Claim an idle worker, creating one if none is available.
    pub fn get_or_create_available_worker(&self) -> Result<Arc<Worker>, OutputError> {
        let mut workers = self.workers.lock();
        workers.retain(|w| w.status() != WorkerStatus::Terminated);
        if let Some(worker) = workers.iter().find(|w| w.try_claim()) {
            return Ok(Arc::clone(worker));
        }

        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id += 1;
            id
        };
        let on_unexpected_error = Arc::clone(&*self.on_unexpected_error.lock());
        let worker = Arc::new(Worker::spawn(id, move |error| on_unexpected_error(error))?);
        assert!(worker.try_claim(), "a fresh worker is idle");
        workers.push(Arc::clone(&worker));
        Ok(worker)
    }

    /// Kill idle workers in excess of the cap, newest-first among idle,
    /// preserving warmed-up workers that have been around longest.
    pub fn limit(&self) {
        let max = (self.calculate_max.lock())().max(1);
        let mut workers = self.workers.lock();
        workers.retain(|w| w.status() != WorkerStatus::Terminated);

        let mut alive = workers.len();
        let mut idle: Vec<Arc<Worker>> = workers
            .iter()
            .filter(|w| w.status() == WorkerStatus::Idle)
            .cloned()
            .collect();
        idle.sort_by_key(|w| std::cmp::Reverse(w.id()));

        for worker in idle {
            if alive <= max {
                break;
            }
            worker.terminate();
            alive -= 1;
        }
        workers.retain(|w| w.status() != WorkerStatus::Terminated);
    }

    /// Asynchronously terminate every worker.
    pub fn terminate(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        std::thread::spawn(move || {
            for worker in workers {
                worker.terminate();
            }
        });
    }

    #[cfg(test)]
    fn alive(&self) -> usize {
        self.workers.lock().len()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
