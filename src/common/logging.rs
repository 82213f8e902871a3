//! Logging and tracing configuration
//!
//! The serve loop owns stdout for the control transport, so all log
//! output goes to stderr, with an optional file layer under the data dir.

use std::path::{Path, PathBuf};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize tracing for serve mode (stderr + data-dir file)
///
/// Log level is controlled by `RUST_LOG`; the `debug` config flag lowers
/// the default from info to debug for this crate.
pub fn init(data_dir: &Path, verbose: bool) -> Option<PathBuf> {
    let default_filter = if verbose {
        "xdebug_bridge=debug,info"
    } else {
        "xdebug_bridge=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .compact();

    // File logging is best-effort; the bridge still works without it
    if std::fs::create_dir_all(data_dir).is_ok() {
        let log_file = data_dir.join("bridge.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
        {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();

            return Some(log_file);
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .init();

    None
}
