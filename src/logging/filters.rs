use tracing_subscriber::EnvFilter;

use super::{config::LoggingConfig, LoggingError};

/// Строит фильтр: `RUST_LOG` имеет приоритет, иначе директива из
/// конфигурации.
///
/// # Возвращает
/// - `LoggingError::InvalidDirective`, если директива из конфигурации не
///   разбирается
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let directive = config.filter_directive();
    EnvFilter::try_new(directive).map_err(|e| LoggingError::InvalidDirective {
        directive: directive.to_string(),
        reason: e.to_string(),
    })
}
