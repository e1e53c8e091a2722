//! Сетевой слой simbus.
//!
//! ## Подмодули
//!
//! - `frame`: формат кадра на проводе, кодировщик и инкрементальный декодер.
//! - `connection`: постоянное TCP-соединение с асинхронным чтением кадров и
//!   очередью записи.
//! - `connection_registry`: таблица активных соединений.
//! - `connection_state`: идентификаторы, состояния и статистика соединений.
//! - `executor`: общий контекст асинхронного ввода-вывода.
//! - `link`: трейт возможностей соединения (`send_frame`, `is_open`,
//!   `on_close`).
//! - `protocol`: управляющие сообщения и сериализация полезной нагрузки.
//! - `server`: слушающий сокет, превращающий входящие потоки в соединения.

pub mod connection;
pub mod connection_registry;
pub mod connection_state;
pub mod endpoint;
pub mod executor;
pub mod frame;
pub mod link;
pub mod protocol;
pub mod server;

// Публичный экспорт основных типов подмодулей, чтобы упростить доступ к ним
// из внешнего кода.
pub use connection::{Connection, ConnectionConfig, FrameHandler};
pub use connection_registry::{ConnectionRegistry, GlobalConnectionStats};
pub use connection_state::{ConnectionId, ConnectionState, ConnectionStats};
pub use endpoint::{Endpoint, EndpointParseError};
pub use executor::{ExecutorConfig, IoExecutor};
pub use frame::{Frame, FrameDecoder, FrameEncoder};
pub use link::{CloseHandler, FrameLink};
pub use server::{AcceptHandler, Server};
