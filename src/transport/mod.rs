//! Клиентская сторона: публикации, подписки и путь доставки данных.
//!
//! - `node`: [`Node`], точка входа `publish` / `subscribe`.
//! - `publication`: транспорты подписчиков одного объявленного топика.
//! - `subscription_transport`: доставка одного сообщения одному подписчику
//!   (локально или через соединение).

pub mod node;
pub mod publication;
pub mod subscription_transport;

// Публичный экспорт основных типов подмодулей, чтобы упростить доступ к ним
// из внешнего кода.
pub use node::{expand_topic, Node, NodeConfig, Publisher, Subscriber, ANY_TYPE};
pub use publication::{AdvertiseOptions, Publication};
pub use subscription_transport::SubscriptionTransport;
