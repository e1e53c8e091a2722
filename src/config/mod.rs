//! Загрузка настроек процесса через крейт `config`.

pub mod settings;

// Публичный экспорт основных типов подмодулей, чтобы упростить доступ к ним
// из внешнего кода.
pub use settings::{
    master_endpoint_from_env, BrokerSettings, NodeSettings, Settings, SettingsError,
    DEFAULT_MASTER_URI, MASTER_URI_ENV,
};
