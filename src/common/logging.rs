//! Logging and tracing configuration
//!
//! The `symbols` command logs compactly to stderr. The proxy server logs to
//! stderr and to a file in the data directory, since it usually runs unattended
//! next to a browser.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// Initialize tracing for one-shot commands (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debugproxy=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for the proxy server (file + stderr logging)
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the server. Default level is DEBUG for this crate; set
/// `RUST_LOG=debugproxy=trace` to see every proxied message.
pub fn init_server() -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debugproxy=debug,info"));

    let dir_error = match paths::ensure_log_dir() {
        Ok(Some(log_dir)) => {
            let appender = tracing_appender::rolling::never(log_dir, "proxy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            let stderr_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .compact();

            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .with(stderr_layer)
                .init();

            return Some(guard);
        }
        Ok(None) => None,
        Err(e) => Some(e),
    };

    // Fallback: stderr only
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .compact(),
        )
        .init();

    if let Some(e) = dir_error {
        tracing::warn!("Could not create log directory: {}", e);
    }
    None
}
