use std::{
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use serde::Serialize;

/// Счётчик идентификаторов соединений, общий для процесса.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Уникальный идентификатор соединения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

/// Состояние соединения в его жизненном цикле.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Поток открыт, кадры принимаются и отправляются
    Connected,
    /// Поток закрыт, новые кадры отклоняются
    Closed,
}

/// Потокобезопасная статистика соединения.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Отправленные кадры
    pub frames_sent: AtomicU64,
    /// Полученные кадры
    pub frames_received: AtomicU64,
    /// Отправленные байты
    pub bytes_sent: AtomicU64,
    /// Полученные байты
    pub bytes_received: AtomicU64,
    /// Ошибки ввода-вывода и разбора
    pub errors: AtomicUsize,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ConnectionId {
    /// Выдаёт следующий свободный идентификатор.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Учитывает кадр, записанный в сокет.
    pub fn record_sent(
        &self,
        bytes: usize,
    ) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Учитывает байты, прочитанные из сокета.
    pub fn record_bytes_received(
        &self,
        bytes: usize,
    ) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Учитывает собранный входящий кадр.
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn get_frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn get_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn get_bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn get_errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl fmt::Display for ConnectionId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что идентификаторы не повторяются.
    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    /// Тест проверяет накопление статистики.
    #[test]
    fn test_stats_accumulate() {
        let stats = ConnectionStats::new();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_bytes_received(7);
        stats.record_frame_received();
        stats.record_error();

        assert_eq!(stats.get_frames_sent(), 2);
        assert_eq!(stats.get_bytes_sent(), 15);
        assert_eq!(stats.get_bytes_received(), 7);
        assert_eq!(stats.get_frames_received(), 1);
        assert_eq!(stats.get_errors(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
