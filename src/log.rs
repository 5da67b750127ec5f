//! Structured logging for corvid.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a task from completing
//! - WARN: Unexpected conditions that are recoverable (lost locks, handoff timeouts)
//! - INFO: High-level notifications (dispatcher start, task status changes)
//! - DEBUG: Detailed operation traces (step transitions, lock attempts)
//! - TRACE: Very detailed traces (store reads and writes)
//!
//! Debug mode can be enabled with `init_with_debug(true)` or `CORVID_DEBUG=1`.
//! `RUST_LOG` overrides both. Output goes to stderr and, when a home
//! directory exists, to `~/.corvid/corvid.log`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::task::{TaskId, TaskType};

static INIT: Once = Once::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging at INFO level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    INIT.call_once(|| {
        let debug_enabled = debug || env_debug();
        DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

        let file_layer = log_path().and_then(|path| {
            // Truncate file on startup
            let file = File::create(&path).ok()?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        });

        let _ = tracing_subscriber::registry()
            .with(filter(debug_enabled))
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(file_layer)
            .try_init();
    });
}

/// Initialize test logging; output is captured by the test harness.
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(filter(true))
        .with_test_writer()
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Span wrapping the execution of one task.
pub fn task_span(task_id: &TaskId, task_type: TaskType, target_id: &str) -> Span {
    tracing::info_span!(
        "task",
        id = %task_id.short(),
        kind = %task_type,
        target = target_id,
    )
}

fn env_debug() -> bool {
    std::env::var("CORVID_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("info,corvid=debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

fn log_path() -> Option<PathBuf> {
    let dir = dirs::home_dir()?.join(".corvid");
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir.join("corvid.log"))
}
