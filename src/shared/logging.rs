use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::non_blocking;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the background log writers alive; logs stop flushing once this is dropped.
pub struct LogGuards {
    _file: WorkerGuard,
    _console: WorkerGuard,
}

pub fn init_logging(log_dir: &str, service_name: &str) -> Result<LogGuards, anyhow::Error> {
    std::fs::create_dir_all(log_dir)?;
    let rotated = rotate_logs_on_startup(log_dir, service_name)?;

    let (non_blocking_file, file_guard) = non_blocking(file_appender(log_dir, service_name));

    // Console output goes to stderr so command output on stdout stays clean
    let (non_blocking_console, console_guard) = non_blocking(std::io::stderr());

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(non_blocking_console)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    info!("Logging initialized - logs will be written to {log_dir}/{service_name}.log");
    if let Some(backup) = rotated {
        info!("Previous log file backed up to: {}", backup);
    }

    Ok(LogGuards {
        _file: file_guard,
        _console: console_guard,
    })
}

/// One file per daemon run. The previous run's file is moved aside on startup.
fn file_appender(log_dir: &str, service_name: &str) -> RollingFileAppender {
    rolling::never(log_dir, format!("{service_name}.log"))
}

/// Moves an existing log aside with a timestamp and returns where it went.
pub fn rotate_logs_on_startup(log_dir: &str, service_name: &str) -> Result<Option<String>, anyhow::Error> {
    let log_file = format!("{log_dir}/{service_name}.log");

    if !Path::new(&log_file).exists() {
        return Ok(None);
    }

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup_file = format!("{log_dir}/{service_name}.{timestamp}.log");
    std::fs::rename(&log_file, &backup_file)?;

    Ok(Some(backup_file))
}
