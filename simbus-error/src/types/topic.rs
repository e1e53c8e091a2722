use std::any::Any;

use crate::{CodecError, ErrorExt, NetworkError, StatusCode};

/// Ошибка доставки одного сообщения через одну подписку.
#[derive(Debug, Clone)]
pub enum DeliveryError {
    /// Соединение подписчика закрыто
    ConnectionClosed,
    /// Полезную нагрузку не удалось сериализовать
    Codec(CodecError),
    /// Прочая сетевая ошибка (например, слишком большой кадр)
    Network(NetworkError),
}

/// Ошибки публикации и подписки на уровне узла.
#[derive(Debug, Clone)]
pub enum TopicError {
    /// Топик не объявлен этим узлом
    NotAdvertised { topic: String },
    /// Топик уже объявлен с другим типом сообщений
    TypeMismatch {
        topic: String,
        expected: String,
        got: String,
    },
    /// Узел уже остановлен
    NodeShutdown,
    /// Ошибка соединения с брокером
    Network(NetworkError),
    /// Ошибка сериализации
    Codec(CodecError),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Delivery failed: connection closed"),
            Self::Codec(e) => write!(f, "Delivery failed: {e}"),
            Self::Network(e) => write!(f, "Delivery failed: {e}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl ErrorExt for DeliveryError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ConnectionClosed => StatusCode::ConnectionClosed,
            Self::Codec(e) => e.status_code(),
            Self::Network(e) => e.status_code(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl From<CodecError> for DeliveryError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<NetworkError> for DeliveryError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::ConnectionClosed => Self::ConnectionClosed,
            other => Self::Network(other),
        }
    }
}

impl std::fmt::Display for TopicError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::NotAdvertised { topic } => write!(f, "Topic '{topic}' is not advertised"),
            Self::TypeMismatch {
                topic,
                expected,
                got,
            } => write!(
                f,
                "Topic '{topic}' carries '{expected}', cannot use it for '{got}'"
            ),
            Self::NodeShutdown => write!(f, "Node is shut down"),
            Self::Network(e) => write!(f, "{e}"),
            Self::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TopicError {}

impl ErrorExt for TopicError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotAdvertised { .. } => StatusCode::NotFound,
            Self::TypeMismatch { .. } => StatusCode::TypeMismatch,
            Self::NodeShutdown => StatusCode::ConnectionClosed,
            Self::Network(e) => e.status_code(),
            Self::Codec(e) => e.status_code(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl From<NetworkError> for TopicError {
    fn from(err: NetworkError) -> Self {
        Self::Network(err)
    }
}

impl From<CodecError> for TopicError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что закрытое соединение превращается в отдельный
    /// вариант ошибки доставки.
    #[test]
    fn test_delivery_from_network_closed() {
        let err: DeliveryError = NetworkError::ConnectionClosed.into();
        assert!(matches!(err, DeliveryError::ConnectionClosed));
        assert_eq!(err.status_code(), StatusCode::ConnectionClosed);

        let other: DeliveryError = NetworkError::AlreadyStarted.into();
        assert!(matches!(other, DeliveryError::Network(_)));
    }

    #[test]
    fn test_topic_error_display() {
        let err = TopicError::TypeMismatch {
            topic: "/a".into(),
            expected: "demo.Pose".into(),
            got: "demo.Text".into(),
        };
        assert_eq!(err.status_code(), StatusCode::TypeMismatch);
        assert!(err.to_string().contains("demo.Pose"));

        let err = TopicError::NotAdvertised { topic: "/b".into() };
        assert_eq!(err.status_code(), StatusCode::NotFound);
    }
}
