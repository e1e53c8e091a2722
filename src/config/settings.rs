use std::{env, path::Path};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::{
    broker::{BrokerConfig, LateSubscriberPolicy, DEFAULT_LISTEN},
    logging::LoggingConfig,
    network::{ConnectionConfig, Endpoint, EndpointParseError, ExecutorConfig},
    transport::NodeConfig,
};

/// Переменная окружения с адресом брокера.
pub const MASTER_URI_ENV: &str = "SIMBUS_MASTER_URI";
pub const DEFAULT_MASTER_URI: &str = "localhost:11345";

/// Ошибки загрузки настроек.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid master endpoint: {0}")]
    Endpoint(#[from] EndpointParseError),
}

/// Раздел `broker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub listen: String,
    pub late_subscriber_policy: LateSubscriberPolicy,
}

/// Раздел `node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Адрес брокера в виде `host:port`
    pub master: String,
    pub bind_host: String,
    pub advertised_host: Option<String>,
    pub namespace: String,
    pub connect_attempts: u32,
    pub retry_interval_ms: u64,
}

/// Настройки процесса.
///
/// Источники по возрастанию приоритета: значения по умолчанию, TOML-файл,
/// переменные окружения вида `SIMBUS_BROKER__LISTEN`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub node: NodeSettings,
    pub connection: ConnectionConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Загружает настройки.
    ///
    /// # Возвращает
    /// - `SettingsError::Config`, если файл указан, но не читается, или
    ///   значение не приводится к типу поля
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("broker.listen", defaults.broker.listen)?
            .set_default("broker.late_subscriber_policy", "request_time_only")?
            .set_default("node.master", defaults.node.master)?
            .set_default("node.bind_host", defaults.node.bind_host)?
            .set_default("node.namespace", defaults.node.namespace)?
            .set_default(
                "node.connect_attempts",
                i64::from(defaults.node.connect_attempts),
            )?
            .set_default("node.retry_interval_ms", defaults.node.retry_interval_ms)?
            .set_default(
                "connection.connect_timeout_ms",
                defaults.connection.connect_timeout_ms,
            )?
            .set_default(
                "connection.max_frame_len",
                defaults.connection.max_frame_len as u64,
            )?
            .set_default(
                "connection.read_buffer_size",
                defaults.connection.read_buffer_size as u64,
            )?
            .set_default(
                "executor.worker_threads",
                defaults.executor.worker_threads as u64,
            )?
            .set_default("executor.thread_name", defaults.executor.thread_name)?
            .set_default(
                "executor.shutdown_timeout_ms",
                defaults.executor.shutdown_timeout_ms,
            )?
            .set_default("logging.level", defaults.logging.level)?
            .set_default("logging.format", "compact")?
            .set_default("logging.with_ansi", defaults.logging.with_ansi)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("SIMBUS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            listen: self.broker.listen.clone(),
            late_subscriber_policy: self.broker.late_subscriber_policy,
            connection: self.connection.clone(),
        }
    }

    /// # Возвращает
    /// - `SettingsError::Endpoint`, если `node.master` не разбирается
    pub fn node_config(&self) -> Result<NodeConfig, SettingsError> {
        Ok(NodeConfig {
            master: self.node.master.parse()?,
            bind_host: self.node.bind_host.clone(),
            advertised_host: self.node.advertised_host.clone(),
            namespace: self.node.namespace.clone(),
            connect_attempts: self.node.connect_attempts,
            retry_interval_ms: self.node.retry_interval_ms,
            connection: self.connection.clone(),
        })
    }
}

fn master_uri_from_env() -> String {
    env::var(MASTER_URI_ENV)
        .ok()
        .filter(|uri| !uri.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MASTER_URI.to_string())
}

/// Адрес брокера из `SIMBUS_MASTER_URI`, по умолчанию `localhost:11345`.
pub fn master_endpoint_from_env() -> Result<Endpoint, EndpointParseError> {
    master_uri_from_env().parse()
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            late_subscriber_policy: LateSubscriberPolicy::default(),
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            master: master_uri_from_env(),
            bind_host: node.bind_host,
            advertised_host: node.advertised_host,
            namespace: node.namespace,
            connect_attempts: node.connect_attempts,
            retry_interval_ms: node.retry_interval_ms,
        }
    }
}
