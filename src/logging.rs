use anyhow::{anyhow, Context, Result};
use atty::Stream;
use slog::{o, Drain, Level, LevelFilter, Logger};
use slog_json::Json;
use slog_scope::GlobalLoggerGuard;
use slog_term::{FullFormat, PlainSyncDecorator, TermDecorator, TestStdoutWriter};
use std::{io::stderr, str::FromStr};
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// How log records are rendered on stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-print on a tty, JSON otherwise (the collector case).
    Auto,
    Json,
    Terminal,
}

impl LogFormat {
    fn wants_json(self) -> bool {
        match self {
            LogFormat::Json => true,
            LogFormat::Terminal => false,
            LogFormat::Auto => atty::isnt(Stream::Stderr),
        }
    }
}

/// Options for configuring logging.
pub struct LoggingConfiguration<'a> {
    pub format: LogFormat,
    /// Attached to every record as `version`.
    pub version: &'a str,
    /// Records below this level are discarded.
    pub level: &'a str,
}

/// Initialize logging. Builds the root logger, installs it in the global
/// scope so `log`-crate users land in it too, and points `tracing` users
/// (tokio, hyper, warp) at a subscriber of their own filtered by RUST_LOG.
/// The returned guard must stay live for the lifetime of the process.
pub fn setup_logging(config: &LoggingConfiguration) -> Result<(Logger, GlobalLoggerGuard)> {
    let level = Level::from_str(config.level)
        .map_err(|_| anyhow!("{} is not a valid log level", config.level))?;

    // Each format builds its whole drain chain; slog_async erases the type
    // difference between the two and keeps record emission off the request
    // path.
    let drain = if config.format.wants_json() {
        let json = Json::new(stderr())
            .set_newlines(true)
            .add_default_keys()
            .build();
        slog_async::Async::new(LevelFilter::new(json, level).fuse()).build()
    } else {
        let term = FullFormat::new(TermDecorator::new().stderr().build()).build();
        slog_async::Async::new(LevelFilter::new(term, level).fuse()).build()
    };

    let root = Logger::root(
        drain.fuse(),
        o!(
            "version" => config.version.to_owned(),
            "pid" => std::process::id(),
        ),
    );

    let guard = slog_scope::set_global_logger(root.clone());
    slog_stdlog::init().context("failed to route the log crate into slog")?;

    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().compact().with_target(true))
        .with(ErrorLayer::default());
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install the tracing subscriber")?;

    Ok((root, guard))
}

/// A synchronous logger for tests. Records print through the harness's
/// captured stdout, so a failing test shows the log lines that led up to
/// it.
pub fn setup_test_logging() -> Logger {
    let drain = FullFormat::new(PlainSyncDecorator::new(TestStdoutWriter))
        .build()
        .fuse();
    Logger::root(drain, o!("test" => true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_selection() {
        assert!(LogFormat::Json.wants_json());
        assert!(!LogFormat::Terminal.wants_json());
        // Auto depends on the environment; both answers are legal, it just
        // must not panic.
        let _ = LogFormat::Auto.wants_json();
    }

    #[test]
    fn test_logger_accepts_records() {
        let logger = setup_test_logging();
        slog::info!(logger, "a record"; "key" => "value");
    }
}
