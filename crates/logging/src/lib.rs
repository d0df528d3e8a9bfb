//! Structured logging setup. Installs a `tracing_subscriber` registry with
//! an `EnvFilter` stdout layer, and — when `LOG_FILE` names a path — a
//! second non-blocking rolling-file layer alongside it.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Must be kept alive for the lifetime of the process; dropping it stops
/// the background file-writer thread.
pub struct LoggingGuard(Option<tracing_appender::non_blocking::WorkerGuard>);

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("watchapp=info,pipeline=info"))
}

/// Initializes global logging. If `log_file` is set, log lines are written
/// there (daily-rolling, non-blocking) in addition to stdout.
pub fn init(log_file: Option<&str>) -> LoggingGuard {
    let stdout_layer = fmt::layer().with_filter(default_filter());

    match log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "watchapp.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking).with_filter(default_filter());

            tracing_subscriber::registry().with(stdout_layer).with(file_layer).init();
            LoggingGuard(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).init();
            LoggingGuard(None)
        }
    }
}

/// A child span naming the component/subsystem emitting subsequent log
/// lines, e.g. `logging::with_file("pipeline").in_scope(|| { ... })`. The
/// two-primitive replacement for a single callable-plus-properties logger
/// object: call `init` once at startup, then `with_file` wherever a module
/// wants its lines tagged with its own name.
pub fn with_file(name: &str) -> tracing::Span {
    tracing::info_span!("module", name = %name)
}
