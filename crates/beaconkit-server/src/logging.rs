//! Logging initialization and configuration.
//!
//! - **Production**: JSON logs to rolling files + compact logs to stdout
//! - **Development**: pretty logs to stdout with span events

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the fallback filter directive.
pub const LOG_LEVEL_ENV: &str = "BEACONKIT_LOG_LEVEL";

// Non-blocking writers stop when their guard drops.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging.
///
/// `RUST_LOG` wins when set; otherwise `BEACONKIT_LOG_LEVEL`, defaulting to
/// `info`.
///
/// In production, logs go to daily rolling JSON files under
/// [`log_directory`] and, without colors, to stdout for the journal. In
/// development they go to stdout only, pretty-printed with span events.
///
/// # Errors
///
/// Returns an error if the filter directive cannot be parsed.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let log_level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    if is_production {
        init_production(env_filter)?;
    } else {
        init_development(env_filter);
    }

    Ok(())
}

fn init_production(env_filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "beaconkit");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Directory for production log files.
#[must_use]
pub fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/beaconkit")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beaconkit")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_is_named_for_the_service() {
        let dir = log_directory();
        assert!(dir.to_string_lossy().contains("beaconkit") || dir.ends_with("logs"));
    }
}
