use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use simbus_error::CodecError;

use crate::network::{endpoint::Endpoint, frame::Frame};

/// Строка версии, которую брокер отправляет в `version_init`.
pub const PROTOCOL_VERSION: &str = concat!("simbus ", env!("CARGO_PKG_VERSION"));

/// Теги управляющих кадров.
pub mod tags {
    pub const ADVERTISE: &str = "advertise";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const PUBLISHER_SUBSCRIBE: &str = "publisher_subscribe";
    pub const PUBLISHER_ADVERTISE: &str = "publisher_advertise";
    pub const UNADVERTISE: &str = "unadvertise";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const REGISTER_TOPIC_NAMESPACE: &str = "register_topic_namespace";
    pub const TOPIC_NAMESPACE_ADD: &str = "topic_namespace_add";
    pub const VERSION_INIT: &str = "version_init";
    pub const TOPIC_NAMESPACES_INIT: &str = "topic_namespaces_init";
    pub const PUBLISHERS_INIT: &str = "publishers_init";
    pub const PUBLISHER_ADD: &str = "publisher_add";
    pub const PUBLISHER_DEL: &str = "publisher_del";
    /// Подписка на данные, отправляемая напрямую издателю.
    pub const SUB: &str = "sub";
}

/// Объявление издателя: топик, тип сообщений и адрес сервера данных.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublishAnnounce {
    pub topic: String,
    pub type_tag: String,
    pub endpoint: Endpoint,
}

/// Запрос подписки к брокеру.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub topic: String,
    pub type_tag: String,
    pub endpoint: Endpoint,
}

/// Ответ брокера: где найти издателя топика.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublisherLocation {
    pub topic: String,
    pub type_tag: String,
    pub endpoint: Endpoint,
}

/// Подписка на поток данных, отправляемая издателю.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSubscribe {
    pub topic: String,
    pub type_tag: String,
}

/// Управляющее сообщение с разобранным телом.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Advertise(PublishAnnounce),
    Subscribe(SubscribeRequest),
    PublisherSubscribe(PublisherLocation),
    PublisherAdvertise(PublisherLocation),
    Unadvertise(PublishAnnounce),
    Unsubscribe(SubscribeRequest),
    RegisterTopicNamespace(String),
    TopicNamespaceAdd(String),
    VersionInit(String),
    TopicNamespacesInit(Vec<String>),
    /// Все известные брокеру издатели, отправляется при подключении.
    PublishersInit(Vec<PublisherLocation>),
    PublisherAdd(PublisherLocation),
    PublisherDel(PublisherLocation),
    DataSubscribe(DataSubscribe),
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ControlMessage {
    /// Тег кадра для этого сообщения.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Advertise(_) => tags::ADVERTISE,
            Self::Subscribe(_) => tags::SUBSCRIBE,
            Self::PublisherSubscribe(_) => tags::PUBLISHER_SUBSCRIBE,
            Self::PublisherAdvertise(_) => tags::PUBLISHER_ADVERTISE,
            Self::Unadvertise(_) => tags::UNADVERTISE,
            Self::Unsubscribe(_) => tags::UNSUBSCRIBE,
            Self::RegisterTopicNamespace(_) => tags::REGISTER_TOPIC_NAMESPACE,
            Self::TopicNamespaceAdd(_) => tags::TOPIC_NAMESPACE_ADD,
            Self::VersionInit(_) => tags::VERSION_INIT,
            Self::TopicNamespacesInit(_) => tags::TOPIC_NAMESPACES_INIT,
            Self::PublishersInit(_) => tags::PUBLISHERS_INIT,
            Self::PublisherAdd(_) => tags::PUBLISHER_ADD,
            Self::PublisherDel(_) => tags::PUBLISHER_DEL,
            Self::DataSubscribe(_) => tags::SUB,
        }
    }

    /// Сериализует сообщение в кадр (тело в формате bincode).
    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        let tag = self.tag();
        let payload = match self {
            Self::Advertise(m) | Self::Unadvertise(m) => encode(tag, m)?,
            Self::Subscribe(m) | Self::Unsubscribe(m) => encode(tag, m)?,
            Self::PublisherSubscribe(m)
            | Self::PublisherAdvertise(m)
            | Self::PublisherAdd(m)
            | Self::PublisherDel(m) => encode(tag, m)?,
            Self::RegisterTopicNamespace(s) | Self::TopicNamespaceAdd(s) | Self::VersionInit(s) => {
                encode(tag, s)?
            }
            Self::TopicNamespacesInit(list) => encode(tag, list)?,
            Self::PublishersInit(list) => encode(tag, list)?,
            Self::DataSubscribe(m) => encode(tag, m)?,
        };
        Ok(Frame::new(tag, payload))
    }

    /// Разбирает кадр по его тегу.
    ///
    /// # Возвращает
    /// - `CodecError::UnknownTag`, если тег не управляющий
    /// - `CodecError::Deserialize`, если тело не соответствует тегу
    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        let tag = frame.tag();
        let body = frame.payload();
        let message = match tag {
            tags::ADVERTISE => Self::Advertise(decode(tag, body)?),
            tags::SUBSCRIBE => Self::Subscribe(decode(tag, body)?),
            tags::PUBLISHER_SUBSCRIBE => Self::PublisherSubscribe(decode(tag, body)?),
            tags::PUBLISHER_ADVERTISE => Self::PublisherAdvertise(decode(tag, body)?),
            tags::UNADVERTISE => Self::Unadvertise(decode(tag, body)?),
            tags::UNSUBSCRIBE => Self::Unsubscribe(decode(tag, body)?),
            tags::REGISTER_TOPIC_NAMESPACE => Self::RegisterTopicNamespace(decode(tag, body)?),
            tags::TOPIC_NAMESPACE_ADD => Self::TopicNamespaceAdd(decode(tag, body)?),
            tags::VERSION_INIT => Self::VersionInit(decode(tag, body)?),
            tags::TOPIC_NAMESPACES_INIT => Self::TopicNamespacesInit(decode(tag, body)?),
            tags::PUBLISHERS_INIT => Self::PublishersInit(decode(tag, body)?),
            tags::PUBLISHER_ADD => Self::PublisherAdd(decode(tag, body)?),
            tags::PUBLISHER_DEL => Self::PublisherDel(decode(tag, body)?),
            tags::SUB => Self::DataSubscribe(decode(tag, body)?),
            other => {
                return Err(CodecError::UnknownTag {
                    tag: other.to_string(),
                })
            }
        };
        Ok(message)
    }
}

fn encode<T: Serialize>(
    tag: &str,
    value: &T,
) -> Result<Bytes, CodecError> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| CodecError::Serialize {
            type_tag: tag.to_string(),
            reason: e.to_string(),
        })
}

fn decode<T: DeserializeOwned>(
    tag: &str,
    body: &[u8],
) -> Result<T, CodecError> {
    bincode::deserialize(body).map_err(|e| CodecError::Deserialize {
        type_tag: tag.to_string(),
        reason: e.to_string(),
    })
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl From<PublishAnnounce> for PublisherLocation {
    fn from(announce: PublishAnnounce) -> Self {
        Self {
            topic: announce.topic,
            type_tag: announce.type_tag,
            endpoint: announce.endpoint,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
