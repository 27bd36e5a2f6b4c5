//! Filesystem watcher wrapper.
//!
//! Thin layer over `notify`: maps raw events to added/changed/removed,
//! drops metadata-only modifications (mtime/chmod noise that would cause
//! rebuild loops), and hands the orchestrator absolute paths. All
//! debouncing and business classification happens in the orchestrator.

use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherEventName {
    Added,
    Changed,
    Removed,
}

impl WatcherEventName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
        }
    }
}

/// Running watcher. Dropping it stops the watch.
pub struct Watcher {
    _watcher: RecommendedWatcher,
}

/// Watch `root` recursively, invoking `on_event` for every relevant file
/// event and `on_error` on watcher failure (fatal for the hot run).
pub fn start(
    root: &Path,
    on_event: impl Fn(WatcherEventName, PathBuf) + Send + 'static,
    on_error: impl Fn(String) + Send + 'static,
) -> notify::Result<Watcher> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                let Some(name) = classify_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    on_event(name, normalize_event_path(path));
                }
            }
            Err(e) => on_error(e.to_string()),
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(Watcher { _watcher: watcher })
}

fn classify_kind(kind: &notify::EventKind) -> Option<WatcherEventName> {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) => Some(WatcherEventName::Added),
        EventKind::Remove(_) => Some(WatcherEventName::Removed),
        // Metadata-only changes are noise
        EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(WatcherEventName::Changed),
        _ => None,
    }
}

/// Resolve symlinks so event paths compare equal to resolved inputs.
/// Removed files cannot be canonicalized; their parent directory is
/// resolved instead.
fn normalize_event_path(path: PathBuf) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => parent.join(name),
            Err(_) => path,
        },
        _ => path,
    }
}

// ============================================================================
// Tests
// ============================================================================
