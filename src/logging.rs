// ABOUTME: Tracing subscriber setup for the bot binary
// ABOUTME: Logs to stdout and to a daily rolling file under the data directory

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::paths;

pub const LOG_FILE_PREFIX: &str = "krypton.log";

/// Install the global subscriber. RUST_LOG wins over `default_level`.
///
/// Keep the returned guard alive for the life of the process or buffered
/// file output is lost.
pub fn init(default_level: &str) -> Result<WorkerGuard> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Keep HTTP request spans quiet unless asked for
        EnvFilter::new(format!("{},tower_http=warn", default_level))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_filter_falls_back_to_default_level() {
        std::env::remove_var("RUST_LOG");
        let filter = filter("debug");
        assert!(filter.to_string().contains("debug"));
        assert!(filter.to_string().contains("tower_http=warn"));
    }

    #[test]
    #[serial]
    fn test_filter_honours_rust_log() {
        std::env::set_var("RUST_LOG", "trace");
        let filter = filter("info");
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "trace");
    }
}
