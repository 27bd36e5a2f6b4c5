//! External process execution.
//!
//! Provides a builder-based API for running child processes with fully
//! buffered output. Nothing is streamed to the calling terminal: stdout
//! and stderr come back as byte buffers, and startup failures are
//! classified instead of raised.
//!
//! # Examples
//!
//! ```ignore
//! use crate::spawn::Cmd;
//!
//! let result = Cmd::new("elm")
//!     .args(["make", "--report=json", "src/Main.elm"])
//!     .cwd(project_root)
//!     .run();
//! ```

use std::{
    ffi::{OsStr, OsString},
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};

use parking_lot::Mutex;

// ============================================================================
// Result types
// ============================================================================

/// Why a child stopped running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    ExitCode(i32),
    Signal(String),
    Unknown,
}

/// Classified outcome of running a child process.
#[derive(Debug)]
pub enum SpawnResult {
    /// The executable was not found on `PATH`.
    CommandNotFound,
    /// Any other pre-exec failure (permissions, bad cwd, ...).
    OtherSpawnError(String),
    /// The pipe to the child closed before all stdin bytes were written.
    StdinWriteError(String),
    Exit {
        reason: ExitReason,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

// ============================================================================
// Builder API
// ============================================================================

/// Command builder for child process execution.
#[derive(Default)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    stdin_data: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            ..Default::default()
        }
    }

    /// Create from a command vector (first token is the program).
    pub fn from_slice<S: AsRef<OsStr>>(cmd: &[S]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().map(|s| s.as_ref().to_owned()).unwrap_or_default();
        let args: Vec<_> = iter.map(|s| s.as_ref().to_owned()).collect();
        Self { program, args, ..Default::default() }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_owned());
        }
        self
    }

    pub fn cwd<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Overlay environment variables on the inherited environment.
    pub fn envs<K, V, I>(mut self, vars: I) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in vars {
            self.envs.push((k.as_ref().to_owned(), v.as_ref().to_owned()));
        }
        self
    }

    /// Bytes to pipe to the child's stdin.
    pub fn stdin<D: AsRef<[u8]>>(mut self, data: D) -> Self {
        self.stdin_data = Some(data.as_ref().to_vec());
        self
    }

    /// Run to completion, buffering stdout and stderr.
    pub fn run(self) -> SpawnResult {
        let killable = self.run_killable();
        killable.wait()
    }

    /// Run with a cancel handle. `kill` is idempotent and safe after the
    /// child has already exited.
    pub fn run_killable(self) -> KillableChild {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().cloned())
            .stdin(if self.stdin_data.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return KillableChild::failed(SpawnResult::CommandNotFound);
            }
            Err(e) => return KillableChild::failed(SpawnResult::OtherSpawnError(e.to_string())),
        };

        // Stdin is written from a thread so a child that exits without
        // reading cannot deadlock us.
        let stdin_handle = self.stdin_data.map(|data| {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            thread::spawn(move || stdin.write_all(&data).map_err(|e| e.to_string()))
        });
        let stdout_handle = reader_thread(child.stdout.take().expect("stdout was piped"));
        let stderr_handle = reader_thread(child.stderr.take().expect("stderr was piped"));

        KillableChild {
            inner: KillableInner::Running {
                child: Arc::new(Mutex::new(child)),
                stdin_handle,
                stdout_handle,
                stderr_handle,
            },
        }
    }
}

fn reader_thread<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

// ============================================================================
// Killable child
// ============================================================================

/// Idempotent cancel handle for a running child.
#[derive(Clone)]
pub struct KillHandle {
    child: Option<Arc<Mutex<Child>>>,
}

impl KillHandle {
    /// Terminate the child. Does nothing if it already exited.
    pub fn kill(&self) {
        if let Some(child) = &self.child {
            // kill on a reaped child returns InvalidInput; ignore it
            let _ = child.lock().kill();
        }
    }
}

enum KillableInner {
    Failed(SpawnResult),
    Running {
        child: Arc<Mutex<Child>>,
        stdin_handle: Option<thread::JoinHandle<Result<(), String>>>,
        stdout_handle: thread::JoinHandle<Vec<u8>>,
        stderr_handle: thread::JoinHandle<Vec<u8>>,
    },
}

/// A spawned child with a cancel handle. Call [`KillableChild::wait`]
/// (blocking) to collect the result.
pub struct KillableChild {
    inner: KillableInner,
}

impl KillableChild {
    fn failed(result: SpawnResult) -> Self {
        Self { inner: KillableInner::Failed(result) }
    }

    pub fn kill_handle(&self) -> KillHandle {
        match &self.inner {
            KillableInner::Failed(_) => KillHandle { child: None },
            KillableInner::Running { child, .. } => KillHandle { child: Some(Arc::clone(child)) },
        }
    }

    /// Block until the child exits and all streams are drained.
    pub fn wait(self) -> SpawnResult {
        match self.inner {
            KillableInner::Failed(result) => result,
            KillableInner::Running { child, stdin_handle, stdout_handle, stderr_handle } => {
                // Short-poll so a concurrent kill() never waits on our lock.
                let status = loop {
                    match child.lock().try_wait() {
                        Ok(Some(status)) => break status,
                        Ok(None) => {}
                        Err(e) => return SpawnResult::OtherSpawnError(e.to_string()),
                    }
                    thread::sleep(Duration::from_millis(10));
                };

                if let Some(handle) = stdin_handle
                    && let Ok(Err(error)) = handle.join()
                {
                    return SpawnResult::StdinWriteError(error);
                }

                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();
                SpawnResult::Exit { reason: exit_reason(status), stdout, stderr }
            }
        }
    }
}

fn exit_reason(status: std::process::ExitStatus) -> ExitReason {
    if let Some(code) = status.code() {
        return ExitReason::ExitCode(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitReason::Signal(signal_name(signal));
        }
    }
    ExitReason::Unknown
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        n => format!("signal {n}"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_and_stdout() {
        let result = Cmd::new("echo").arg("hello").run();
        match result {
            SpawnResult::Exit { reason, stdout, .. } => {
                assert_eq!(reason, ExitReason::ExitCode(0));
                assert_eq!(String::from_utf8_lossy(&stdout).trim(), "hello");
            }
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[test]
    fn test_stdin_roundtrip() {
        let result = Cmd::new("cat").stdin(b"piped bytes").run();
        match result {
            SpawnResult::Exit { stdout, .. } => assert_eq!(stdout, b"piped bytes"),
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[test]
    fn test_command_not_found() {
        let result = Cmd::new("definitely-not-a-real-command-a3f9").run();
        assert!(matches!(result, SpawnResult::CommandNotFound));
    }

    #[test]
    fn test_nonzero_exit() {
        let result = Cmd::new("sh").args(["-c", "exit 3"]).run();
        match result {
            SpawnResult::Exit { reason, .. } => assert_eq!(reason, ExitReason::ExitCode(3)),
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[test]
    fn test_env_overlay() {
        let result = Cmd::new("sh")
            .args(["-c", "printf '%s' \"$WATCH_TEST_VAR\""])
            .envs([("WATCH_TEST_VAR", "overlaid")])
            .run();
        match result {
            SpawnResult::Exit { stdout, .. } => assert_eq!(stdout, b"overlaid"),
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[test]
    fn test_kill_terminates_child() {
        let killable = Cmd::new("sleep").arg("30").run_killable();
        let kill = killable.kill_handle();
        kill.kill();
        kill.kill(); // idempotent
        match killable.wait() {
            SpawnResult::Exit { reason, .. } => {
                assert_eq!(reason, ExitReason::Signal("SIGKILL".to_string()));
            }
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[test]
    fn test_kill_after_exit_is_safe() {
        let killable = Cmd::new("true").run_killable();
        let kill = killable.kill_handle();
        let result = killable.wait();
        kill.kill();
        assert!(matches!(result, SpawnResult::Exit { reason: ExitReason::ExitCode(0), .. }));
    }
}
