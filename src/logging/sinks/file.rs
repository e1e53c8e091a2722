use std::fs;

use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling::daily};
use tracing_subscriber::{fmt, registry::LookupSpan, Layer};

use crate::logging::{config::FileLogConfig, LoggingError};

/// Файловый слой с ежедневной ротацией и неблокирующей записью.
///
/// # Примечание
/// `WorkerGuard` нужно держать до завершения процесса, иначе хвост логов
/// будет потерян.
pub fn layer<S>(
    config: &FileLogConfig
) -> Result<(Box<dyn Layer<S> + Send + Sync>, WorkerGuard), LoggingError>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fs::create_dir_all(&config.dir).map_err(|e| LoggingError::LogDir {
        path: config.dir.clone(),
        source: e,
    })?;

    let appender = daily(&config.dir, &config.prefix);
    let (writer, guard) = non_blocking(appender);

    let layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer);

    Ok((Box::new(layer), guard))
}
