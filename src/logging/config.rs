use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Формат вывода в консоль.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Многострочный человекочитаемый вывод
    Pretty,
    /// Одна строка на событие
    #[default]
    Compact,
    /// JSON, одна запись на строку
    Json,
}

/// Параметры файлового вывода с ежедневной ротацией.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileLogConfig {
    pub dir: PathBuf,
    /// Префикс имени файла; к нему добавляется дата
    pub prefix: String,
}

/// Конфигурация логирования.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Уровень или директива `EnvFilter`, например `"info"` или
    /// `"simbus=debug,info"`. `RUST_LOG` имеет приоритет.
    pub level: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    /// Файловый вывод; `None` отключает его
    pub file: Option<FileLogConfig>,
}

impl LoggingConfig {
    /// Директива фильтра из настроек.
    pub fn filter_directive(&self) -> &str {
        let level = self.level.trim();
        if level.is_empty() {
            "info"
        } else {
            level
        }
    }
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            prefix: "simbus.log".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            with_ansi: true,
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_level_falls_back_to_info() {
        let config = LoggingConfig {
            level: "  ".into(),
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "info");

        let config = LoggingConfig {
            level: "simbus=debug".into(),
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "simbus=debug");
    }
}
