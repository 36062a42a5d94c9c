//! Structured logging for orchestra.
//!
//! Log levels:
//! - ERROR: Run aborts
//! - WARN: Recoverable anomalies (ownership conflicts, stalls, gaps, forced terminations)
//! - INFO: Run lifecycle (mode selection, layer advancement, worker spawn/terminate)
//! - DEBUG: Task state transitions and message routing
//! - TRACE: Individual progress messages
//!
//! Debug mode can be enabled with `--debug` flag or `ORCHESTRA_DEBUG=1` env var.
//! `RUST_LOG` overrides both. Output goes to stderr so `--json` output on
//! stdout stays machine-readable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Only the first call installs a subscriber; later calls only update
/// the debug flag.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));
        // Another subscriber may already be installed (tests, embedding apps).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var("ORCHESTRA_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "orchestra=debug,info"
    } else {
        "info"
    }
}
