//! Application-facing log sink.
//!
//! Internal diagnostics go through `tracing` like the rest of the crate.  The
//! sink is the separate, user-visible channel the managers and discovery
//! service write status lines to ("Listener socket bound to ...", error
//! reports).  The default sink forwards every line to `tracing::info!`, so an
//! application with a subscriber installed sees them without extra wiring.

use std::sync::Arc;

use tracing::info;

use crate::error::NetError;

/// Callback receiving one human-readable status line at a time.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Sink that forwards lines to `tracing` at INFO level.
pub fn default_log_sink() -> LogSink {
    Arc::new(|line: &str| info!(target: "lanlink", "{line}"))
}

/// Sink that discards every line.
pub fn silent_log_sink() -> LogSink {
    Arc::new(|_: &str| {})
}

/// Writes an error's coded report line to `sink`.
pub(crate) fn report(sink: &LogSink, err: &NetError) {
    sink(&err.report_line());
}
