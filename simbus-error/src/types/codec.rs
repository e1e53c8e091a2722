use std::any::Any;

use crate::{ErrorExt, StatusCode};

/// Ошибки сериализации полезной нагрузки и управляющих сообщений.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Не удалось сериализовать значение
    Serialize { type_tag: String, reason: String },
    /// Не удалось десериализовать значение
    Deserialize { type_tag: String, reason: String },
    /// Неизвестный тег управляющего кадра
    UnknownTag { tag: String },
    /// Тип значения не совпадает с ожидаемым
    TypeMismatch { expected: String, got: String },
}

impl std::fmt::Display for CodecError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::Serialize { type_tag, reason } => {
                write!(f, "Failed to serialize '{type_tag}': {reason}")
            }
            Self::Deserialize { type_tag, reason } => {
                write!(f, "Failed to deserialize '{type_tag}': {reason}")
            }
            Self::UnknownTag { tag } => write!(f, "Unknown message tag '{tag}'"),
            Self::TypeMismatch { expected, got } => {
                write!(f, "Type mismatch: expected '{expected}', got '{got}'")
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl ErrorExt for CodecError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Serialize { .. } => StatusCode::EncodingError,
            Self::Deserialize { .. } => StatusCode::DecodingError,
            Self::UnknownTag { .. } => StatusCode::UnknownMessage,
            Self::TypeMismatch { .. } => StatusCode::TypeMismatch,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_codes() {
        let unknown = CodecError::UnknownTag { tag: "bogus".into() };
        assert_eq!(unknown.status_code(), StatusCode::UnknownMessage);
        assert_eq!(unknown.to_string(), "Unknown message tag 'bogus'");

        let de = CodecError::Deserialize {
            type_tag: "advertise".into(),
            reason: "eof".into(),
        };
        assert_eq!(de.status_code(), StatusCode::DecodingError);
        assert!(de.status_code().is_protocol_error());
    }
}
