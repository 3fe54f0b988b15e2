use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise tracing for a host embedding the widget engine.
///
/// `RUST_LOG` wins over `log_level` when set. With a log directory, events
/// additionally land in a daily-rolling JSON file; keep the returned guard
/// alive for the lifetime of the host or buffered lines are lost.
pub fn init_tracing(log_level: &str, log_dir: Option<PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "widget.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Registry::default()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().json().with_writer(writer).with_ansi(false))
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            Registry::default()
                .with(filter)
                .with(fmt::layer())
                .try_init()?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_not_fatal_twice() {
        // second init fails inside tracing, not in our code
        let first = init_tracing("info", None);
        assert!(first.is_ok());
        let second = init_tracing("info", None);
        assert!(second.is_err());
    }
}
