use std::{any::Any, fmt, sync::Arc};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Serialize};
use simbus_error::CodecError;

/// Сообщение с постоянным тегом типа, которое можно передавать по топику.
///
/// Кодирование по умолчанию использует `bincode`. Тег типа передаётся в
/// заголовке кадра данных и сверяется у подписчика.
pub trait TypedMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Тег типа, например `"simbus.Text"`.
    const TYPE_TAG: &'static str;

    fn encode(&self) -> Result<Bytes, CodecError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| CodecError::Serialize {
                type_tag: Self::TYPE_TAG.to_string(),
                reason: e.to_string(),
            })
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialize {
            type_tag: Self::TYPE_TAG.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Уже сериализованная полезная нагрузка с тегом типа.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub type_tag: String,
    pub bytes: Bytes,
}

type AnyValue = dyn Any + Send + Sync;
type AnyEncoder = fn(&AnyValue) -> Result<Bytes, CodecError>;

/// Одно публикуемое сообщение, разделяемое между всеми транспортами
/// публикации.
///
/// Локальные подписчики получают значение напрямую, без сериализации.
/// Байтовое представление вычисляется лениво и не более одного раза,
/// сколько бы удалённых транспортов его ни запросили.
pub struct OutgoingMessage<'a> {
    type_tag: &'a str,
    value: Option<&'a AnyValue>,
    encoder: Option<AnyEncoder>,
    encoded: OnceCell<Bytes>,
}

/// Сообщение, пришедшее подписчику.
#[derive(Clone, Copy)]
pub enum IncomingMessage<'a> {
    /// Значение из того же процесса, без сериализации
    Local(&'a OutgoingMessage<'a>),
    /// Байты, полученные по сети (или сохранённые при latch)
    Remote { type_tag: &'a str, bytes: &'a Bytes },
}

/// Текстовое сообщение, которым пользуется `simbus-cli`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Text {
    pub data: String,
}

/// Обработчик сообщений подписчика.
pub type MessageHandler = Arc<dyn Fn(&IncomingMessage<'_>) + Send + Sync + 'static>;

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl RawMessage {
    pub fn new(
        type_tag: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            type_tag: type_tag.into(),
            bytes: bytes.into(),
        }
    }
}

impl<'a> OutgoingMessage<'a> {
    pub fn typed<M: TypedMessage>(value: &'a M) -> Self {
        Self {
            type_tag: M::TYPE_TAG,
            value: Some(value as &AnyValue),
            encoder: Some(encode_any::<M> as AnyEncoder),
            encoded: OnceCell::new(),
        }
    }

    pub fn raw(
        type_tag: &'a str,
        bytes: Bytes,
    ) -> Self {
        Self {
            type_tag,
            value: None,
            encoder: None,
            encoded: OnceCell::with_value(bytes),
        }
    }

    pub fn type_tag(&self) -> &str {
        self.type_tag
    }

    /// Сериализованное представление.
    ///
    /// # Примечание
    /// Сериализация выполняется при первом вызове, последующие вызовы
    /// возвращают тот же буфер.
    pub fn bytes(&self) -> Result<Bytes, CodecError> {
        self.encoded
            .get_or_try_init(|| match (self.encoder, self.value) {
                (Some(encoder), Some(value)) => encoder(value),
                _ => Ok(Bytes::new()),
            })
            .cloned()
    }

    /// Было ли сообщение уже сериализовано.
    pub fn is_encoded(&self) -> bool {
        self.encoded.get().is_some()
    }

    pub fn downcast_ref<M: TypedMessage>(&self) -> Option<&M> {
        self.value.and_then(|value| value.downcast_ref::<M>())
    }
}

impl<'a> IncomingMessage<'a> {
    pub fn type_tag(&self) -> &str {
        match self {
            Self::Local(message) => message.type_tag(),
            Self::Remote { type_tag, .. } => type_tag,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Байты сообщения. Для локального сообщения вызывает сериализацию.
    pub fn bytes(&self) -> Result<Bytes, CodecError> {
        match self {
            Self::Local(message) => message.bytes(),
            Self::Remote { bytes, .. } => Ok((*bytes).clone()),
        }
    }

    /// Ссылка на типизированное значение, если сообщение локальное.
    pub fn downcast_ref<M: TypedMessage>(&self) -> Option<&M> {
        match self {
            Self::Local(message) => message.downcast_ref::<M>(),
            Self::Remote { .. } => None,
        }
    }

    /// Передаёт типизированное значение в `f`: локальное напрямую,
    /// удалённое после десериализации.
    ///
    /// # Возвращает
    /// - `CodecError::TypeMismatch`, если тег не совпадает с `M::TYPE_TAG`
    pub fn with_typed<M, R>(
        &self,
        f: impl FnOnce(&M) -> R,
    ) -> Result<R, CodecError>
    where
        M: TypedMessage,
    {
        if self.type_tag() != M::TYPE_TAG {
            return Err(CodecError::TypeMismatch {
                expected: M::TYPE_TAG.to_string(),
                got: self.type_tag().to_string(),
            });
        }
        if let Some(value) = self.downcast_ref::<M>() {
            return Ok(f(value));
        }
        let value = M::decode(&self.bytes()?)?;
        Ok(f(&value))
    }
}

fn encode_any<M: TypedMessage>(value: &AnyValue) -> Result<Bytes, CodecError> {
    match value.downcast_ref::<M>() {
        Some(value) => value.encode(),
        None => Err(CodecError::TypeMismatch {
            expected: M::TYPE_TAG.to_string(),
            got: "unknown".to_string(),
        }),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl TypedMessage for Text {
    const TYPE_TAG: &'static str = "simbus.Text";
}

impl From<&str> for Text {
    fn from(data: &str) -> Self {
        Self {
            data: data.to_string(),
        }
    }
}

impl fmt::Debug for OutgoingMessage<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("type_tag", &self.type_tag)
            .field("typed", &self.value.is_some())
            .field("encoded", &self.is_encoded())
            .finish()
    }
}

impl fmt::Debug for IncomingMessage<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Local(message) => f.debug_tuple("Local").field(message).finish(),
            Self::Remote { type_tag, bytes } => f
                .debug_struct("Remote")
                .field("type_tag", type_tag)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
