//! Logging utilities with colored output and status display.
//!
//! This module provides:
//! - `log!` macro for formatted terminal output with colored prefixes
//! - `debug!` macro gated on the global verbose flag
//! - a redrawable status block for hot mode
//!
//! Two rendering regimes exist: "fancy" (emoji + ANSI colors, cursor
//! moves) and "plain". Fancy requires stderr to be a TTY, `NO_COLOR` to
//! be unset, and a non-Windows platform.

use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use std::{
    io::{IsTerminal, Write, stderr},
    sync::LazyLock,
    sync::atomic::{AtomicBool, Ordering},
};

/// Global verbose flag (set by --verbose CLI argument)
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Set verbose mode globally
pub fn set_verbose(v: bool) {
    VERBOSE.store(v, Ordering::SeqCst);
}

/// Check if verbose mode is enabled
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::SeqCst)
}

/// Check whether fancy rendering (emoji + ANSI + cursor moves) is active.
///
/// Cached on first call; the regime does not change mid-run.
pub fn fancy() -> bool {
    static FANCY: LazyLock<bool> = LazyLock::new(|| {
        cfg!(not(windows)) && std::env::var_os("NO_COLOR").is_none() && stderr().is_terminal()
    });
    *FANCY
}

/// Query the terminal width, if stderr is a terminal.
pub fn terminal_width() -> Option<u16> {
    if stderr().is_terminal() {
        crossterm::terminal::size().map(|(w, _)| w).ok()
    } else {
        None
    }
}

// ============================================================================
// Log Macro
// ============================================================================

/// Log a message with a colored module prefix
///
/// # Usage
/// ```ignore
/// log!("module"; "message with {} formatting", args);
/// ```
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

/// Log a debug message (only shown when --verbose is enabled)
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_verbose() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

/// Log a message with a colored module prefix
#[inline]
pub fn log(module: &str, message: &str) {
    let prefix = colorize_prefix(module);

    let mut status = STATUS.lock();
    let mut stderr = stderr().lock();
    let _ = status.clear_block(&mut stderr);
    writeln!(stderr, "{prefix} {message}").ok();
    stderr.flush().ok();
}

/// Apply color to a module prefix based on module type
#[inline]
fn colorize_prefix(module: &str) -> String {
    let prefix = format!("[{module}]");
    if !fancy() {
        return prefix;
    }
    match module {
        "watch" => prefix.bright_green().bold().to_string(),
        "ws" => prefix.bright_blue().bold().to_string(),
        "error" => prefix.bright_red().bold().to_string(),
        _ => prefix.bright_yellow().bold().to_string(),
    }
}

/// Clear the whole screen (used right before a hot restart).
pub fn clear_screen() {
    if fancy() {
        let mut status = STATUS.lock();
        let mut stderr = stderr().lock();
        execute!(stderr, Clear(ClearType::All), cursor::MoveTo(0, 0)).ok();
        status.last_lines = 0;
    }
}

// ============================================================================
// Status block (redrawable multi-line status for hot mode)
// ============================================================================

/// Redrawable status block for hot mode.
///
/// In fancy mode the previous block is erased with cursor-relative moves
/// before the new one is written, so per-target status lines update in
/// place. The line count must not change between a write and the next
/// redraw; callers always draw the full grid of lines.
///
/// In plain mode every write appends, nothing is erased.
struct StatusBlock {
    /// Lines of previous output to clear
    last_lines: usize,
}

static STATUS: LazyLock<Mutex<StatusBlock>> = LazyLock::new(|| Mutex::new(StatusBlock::new()));

impl StatusBlock {
    const fn new() -> Self {
        Self { last_lines: 0 }
    }

    fn clear_block(&mut self, stderr: &mut impl Write) -> std::io::Result<()> {
        if fancy() && self.last_lines > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let lines = self.last_lines as u16;
            execute!(stderr, cursor::MoveUp(lines), Clear(ClearType::FromCursorDown))?;
        }
        self.last_lines = 0;
        Ok(())
    }

    fn display(&mut self, block: &str) {
        let mut stderr = stderr().lock();
        let _ = self.clear_block(&mut stderr);
        writeln!(stderr, "{block}").ok();
        stderr.flush().ok();
        if fancy() {
            self.last_lines = block.matches('\n').count() + 1;
        }
    }
}

/// Redraw the global status block in place.
pub fn status(block: &str) {
    STATUS.lock().display(block);
}

/// Erase the current status block without replacing it.
pub fn clear_status() {
    let mut status = STATUS.lock();
    let mut stderr = stderr().lock();
    let _ = status.clear_block(&mut stderr);
    stderr.flush().ok();
}

/// Write a block that scrolls away (detaches the current status block).
pub fn line(message: &str) {
    let mut status = STATUS.lock();
    let mut stderr = stderr().lock();
    if fancy() {
        status.last_lines = 0;
    }
    writeln!(stderr, "{message}").ok();
    stderr.flush().ok();
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_line_count() {
        let block = "main: compiling\nadmin: queued\nworker: success";
        assert_eq!(block.matches('\n').count() + 1, 3);
    }

    #[test]
    fn test_colorize_prefix_plain() {
        // Non-TTY stderr under the test harness → plain prefix
        if !fancy() {
            assert_eq!(colorize_prefix("watch"), "[watch]");
        }
    }
}
