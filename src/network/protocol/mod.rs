//! Управляющие сообщения брокера и сериализация полезной нагрузки.
//!
//! - `control`: теги и тела управляющих кадров (`advertise`, `subscribe`,
//!   `publisher_subscribe` и т.д.).
//! - `message`: трейт [`TypedMessage`] и обёртки исходящих/входящих
//!   сообщений для доставки подписчикам.

pub mod control;
pub mod message;

// Публичный экспорт основных типов подмодулей, чтобы упростить доступ к ним
// из внешнего кода.
pub use control::{
    tags, ControlMessage, DataSubscribe, PublishAnnounce, PublisherLocation, SubscribeRequest,
    PROTOCOL_VERSION,
};
pub use message::{
    IncomingMessage, MessageHandler, OutgoingMessage, RawMessage, Text, TypedMessage,
};
