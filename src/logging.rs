use crate::config::LoggingConfig;
use anyhow::Result;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the background file writer alive; drop it on shutdown to flush.
#[must_use]
pub struct LogGuard {
    file: Option<WorkerGuard>,
}

impl LogGuard {
    pub fn has_file_output(&self) -> bool {
        self.file.is_some()
    }
}

/// `RUST_LOG` wins over the configured level
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn console_layer(json: bool) -> BoxedLayer {
    if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    }
}

/// Initialize the global subscriber. `file_prefix` names the rotated log
/// files when a directory is configured.
pub fn init_logging(config: &LoggingConfig, file_prefix: &str) -> Result<LogGuard> {
    let mut layers = vec![console_layer(config.json)];
    let mut file_guard = None;

    if let Some(dir) = &config.directory {
        fs::create_dir_all(dir)?;
        let appender = rolling::daily(dir, format!("{file_prefix}.log"));
        let (writer, guard) = non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = if config.json {
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed()
        } else {
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true)
                .with_writer(writer)
                .boxed()
        };
        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(&config.level))
        .try_init()?;

    tracing::info!(
        level = %config.level,
        json = config.json,
        directory = ?config.directory,
        "📝 logging initialized"
    );

    Ok(LogGuard { file: file_guard })
}
