use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::burrow::config;

#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Builds the filter used when `RUST_LOG` is unset. The multiplexer logs
/// every frame at debug, so it stays at warn unless asked for by name.
fn filter_directive(level: &str) -> String {
    let level = match level {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    };
    format!("{level},tokio_yamux=warn,rustls=warn")
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let level = logging.level.trim().to_ascii_lowercase();
    let fmt = logging.format.trim().to_ascii_lowercase();
    let out = logging.output.trim();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(&level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(out)?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text" && out == "stderr")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = match fmt.as_str() {
        "json" => base_fmt.json().boxed(),
        "text" => base_fmt.boxed(),
        other => anyhow::bail!("logging: unknown format {:?} (expected json or text)", other),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: subscriber already installed")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(
    output: &str,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}
