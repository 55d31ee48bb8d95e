pub mod audit;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod metrics;
pub mod update;

/// Initializes the global tracing subscriber shared by both binaries.
///
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime —
/// dropping it flushes and stops the background writer thread.
///
/// Falls back to stdout-only logging with a warning if the log directory
/// cannot be created; never panics on a bad log path.
pub fn init_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("ops-agent.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level.to_string()))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
