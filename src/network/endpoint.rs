use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Адрес слушающего сокета: брокера или сервера данных узла.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Ошибка разбора строки адреса.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("endpoint '{0}' has no port")]
    MissingPort(String),
    #[error("endpoint '{0}' has an empty host")]
    EmptyHost(String),
    #[error("endpoint '{input}' has an invalid port: {reason}")]
    InvalidPort { input: String, reason: String },
}

impl Endpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Разбирает `host:port`, допускает префикс схемы `http://` или `tcp://`.
/// Порт отделяется по последнему двоеточию.
impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let without_scheme = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("tcp://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        let (host, port) = without_scheme
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| EndpointParseError::InvalidPort {
                input: s.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::new(host, port))
    }
}
