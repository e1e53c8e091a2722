use std::fmt;

use num_enum::TryFromPrimitive;

/// Коды статуса для категоризации ошибок транспорта.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки
/// - 2xxx: Ошибки данных (топики, типы сообщений)
/// - 6xxx: Сеть / IO
/// - 8xxx: Протокольные ошибки (кадры, управляющие сообщения)
/// - 9xxx: Исполнитель ввода-вывода
///
/// `num_enum::TryFromPrimitive` даёт нативную реализацию `TryFrom<u32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Unexpected = 1002,
    Internal = 1003,
    InvalidArgs = 1004,

    // === 2xxx: Ошибки данных ===
    NotFound = 2000,
    TypeMismatch = 2002,

    // === 6xxx: Сеть/IO ===
    Io = 6000,
    ConnectionClosed = 6001,
    Timeout = 6002,
    ProtocolError = 6003,
    ConnectionFailed = 6004,
    UnexpectedEof = 6007,

    // === 8xxx: Протокол ===
    InvalidFrame = 8000,
    UnknownMessage = 8001,
    VersionMismatch = 8003,
    InvalidUtf8 = 8004,
    SizeLimit = 8007,
    EncodingError = 8010,
    DecodingError = 8011,

    // === 9xxx: Исполнитель ===
    ExecutorStartFailed = 9000,
    ExecutorStopped = 9001,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить вариант `StatusCode` из `u32`.
    ///
    /// Возвращает `None`, если значение не соответствует ни одному варианту.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Имеет ли смысл повторить операцию через новое соединение.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed | Self::ConnectionClosed
        )
    }

    /// Ошибка протокола или разбора кадра (диапазон 8xxx).
    pub fn is_protocol_error(&self) -> bool {
        (8000..=8999).contains(&self.code())
    }

    /// Ошибка, после которой процесс не может продолжать работу.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ExecutorStartFailed)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
