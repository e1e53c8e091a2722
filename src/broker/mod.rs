//! Брокер simbus: реестр издателей и подписчиков и сопоставление топиков.
//!
//! ## Подмодули
//!
//! - `master`: сервис брокера, принимающий соединения узлов.
//! - `registry`: записи издателей и подписчиков, привязанные к соединениям.

pub mod master;
pub mod registry;

// Публичный экспорт основных типов подмодулей, чтобы упростить доступ к ним
// из внешнего кода.
pub use master::{Broker, BrokerConfig, LateSubscriberPolicy, DEFAULT_LISTEN};
pub use registry::{PublisherRecord, SubscriberRecord, TopicRegistry};
