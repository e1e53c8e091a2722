use std::any::Any;

use crate::{ErrorExt, ExecutorError, StatusCode};

/// Ошибки разбора и сборки кадров.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Длина или тег не согласуются с доступными байтами
    MalformedFrame { reason: String },
    /// Кадр превышает допустимый размер
    FrameTooLarge { size: usize, max: usize },
    /// Тег не помещается в 16-битное поле длины
    TagTooLong { len: usize },
}

/// Ошибки сетевого подключения и передачи данных.
#[derive(Debug, Clone)]
pub enum NetworkError {
    /// Не удалось подключиться
    ConnectionFailed { address: String, reason: String },
    /// Таймаут подключения
    ConnectionTimeout { address: String },
    /// Попытка записи в закрытое соединение
    ConnectionClosed,
    /// Цикл чтения или приёма уже запущен
    AlreadyStarted,
    /// Ошибка кадра
    Frame(FrameError),
    /// Ошибка ввода-вывода сокета
    Io {
        kind: std::io::ErrorKind,
        reason: String,
    },
    /// Исполнитель не смог принять задачу
    Executor(ExecutorError),
}

impl std::fmt::Display for FrameError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::MalformedFrame { reason } => write!(f, "Malformed frame: {reason}"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "Frame too large: {size} bytes (max {max})")
            }
            Self::TagTooLong { len } => write!(f, "Frame tag too long: {len} bytes"),
        }
    }
}

impl std::error::Error for FrameError {}

impl ErrorExt for FrameError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedFrame { .. } => StatusCode::InvalidFrame,
            Self::FrameTooLarge { .. } | Self::TagTooLong { .. } => StatusCode::SizeLimit,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed { address, reason } => {
                write!(f, "Failed to connect to {address}: {reason}")
            }
            Self::ConnectionTimeout { address } => write!(f, "Connection timeout to {address}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::AlreadyStarted => write!(f, "Read or accept loop already started"),
            Self::Frame(e) => write!(f, "{e}"),
            Self::Io { reason, .. } => write!(f, "I/O error: {reason}"),
            Self::Executor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Frame(e) => Some(e),
            Self::Executor(e) => Some(e),
            _ => None,
        }
    }
}

impl ErrorExt for NetworkError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ConnectionFailed { .. } => StatusCode::ConnectionFailed,
            Self::ConnectionTimeout { .. } => StatusCode::Timeout,
            Self::ConnectionClosed => StatusCode::ConnectionClosed,
            Self::AlreadyStarted => StatusCode::InvalidArgs,
            Self::Frame(e) => e.status_code(),
            Self::Io { kind, .. } => match kind {
                std::io::ErrorKind::UnexpectedEof => StatusCode::UnexpectedEof,
                std::io::ErrorKind::TimedOut => StatusCode::Timeout,
                std::io::ErrorKind::ConnectionRefused => StatusCode::ConnectionFailed,
                _ => StatusCode::Io,
            },
            Self::Executor(e) => e.status_code(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        match self {
            Self::ConnectionFailed { .. } => "Connection failed".to_string(),
            Self::ConnectionTimeout { .. } => "Connection timeout".to_string(),
            Self::ConnectionClosed => "Connection closed".to_string(),
            Self::Frame(_) => "Invalid frame".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<FrameError> for NetworkError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

impl From<ExecutorError> for NetworkError {
    fn from(err: ExecutorError) -> Self {
        Self::Executor(err)
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
