//! Инициализация `tracing`: фильтр, консольный вывод в выбранном формате
//! и (по желанию) файловый вывод с ежедневной ротацией.

pub mod config;
mod filters;
mod formatter;
pub mod handle;
pub mod sinks;

use std::path::PathBuf;

pub use config::{FileLogConfig, LogFormat, LoggingConfig};
pub use handle::LoggingHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Ошибки инициализации логирования.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter directive '{directive}': {reason}")]
    InvalidDirective { directive: String, reason: String },
    #[error("failed to create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Инициализация логирования с конфигурацией.
///
/// # Возвращает
/// - `LoggingHandle`, который нужно держать до завершения процесса
/// - `LoggingError::AlreadyInitialized` при повторном вызове
pub fn init_logging(config: LoggingConfig) -> Result<LoggingHandle, LoggingError> {
    let filter = filters::build_filter(&config)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(formatter::build_console_layer(config.format, config.with_ansi));

    let file_guard = match &config.file {
        Some(file) => {
            let (layer, guard) = sinks::file::layer(file)?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = config.filter_directive(),
        format = ?config.format,
        file = config.file.is_some(),
        "Logging initialized"
    );

    Ok(LoggingHandle::new(file_guard))
}
