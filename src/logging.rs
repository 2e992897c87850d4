//! Logging configuration with journald support on Linux.
//!
//! The daemon logs to systemd's journal when it is reachable, otherwise to a
//! daily rolling file. `--log-stderr` bypasses both for foreground runs.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log output should go.
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// Journald on Linux, rolling file elsewhere or when journald is missing.
    System { log_dir: Option<PathBuf> },
    Stderr,
}

/// Initialize the logging system.
///
/// Log level is read from `AVSHELF_LOG` (`debug`, `info`, `warn`, `error`
/// or any `EnvFilter` directive) and defaults to `info`.
pub fn init(target: LogTarget) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("AVSHELF_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            return Ok(());
        }
        LogTarget::System { log_dir } => log_dir,
    };

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .init();

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("avshelf")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "avshelf.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread; keep it for the process lifetime.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}
