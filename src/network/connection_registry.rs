use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::{
    connection::Connection,
    connection_state::ConnectionId,
};

/// Реестр активных соединений процесса.
///
/// Потокобезопасное множество соединений, ключом служит [`ConnectionId`].
/// Удаление отсутствующего соединения ничего не делает: его могут
/// одновременно запросить и явное закрытие, и ошибка цикла чтения.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

/// Глобальная статистика по всем соединениям.
///
/// # Поля
/// * `active_connections` - кол-во соединений в реестре.
/// * `total_frames_sent` - общее число отправленных кадров.
/// * `total_frames_received` - общее число принятых кадров.
/// * `total_bytes_sent` - общее число отправленных байт.
/// * `total_bytes_received` - общее число полученных байт.
/// * `total_errors` - общее число ошибок на соединениях.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GlobalConnectionStats {
    pub active_connections: usize,
    pub total_frames_sent: u64,
    pub total_frames_received: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_errors: usize,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Добавляет соединение.
    ///
    /// # Возвращает
    /// - `true`, если соединения ещё не было в реестре
    pub fn add(
        &self,
        connection: Arc<Connection>,
    ) -> bool {
        let id = connection.id();
        let inserted = self.connections.write().insert(id, connection).is_none();
        if inserted {
            debug!(connection = %id, "Connection registered");
        }
        inserted
    }

    /// Удаляет соединение из реестра.
    ///
    /// # Примечание
    /// Если `id` отсутствует, метод спокойно ничего не делает. Само
    /// соединение не закрывается.
    pub fn remove(
        &self,
        id: ConnectionId,
    ) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        if removed.is_some() {
            debug!(connection = %id, "Connection unregistered");
        }
        removed
    }

    pub fn get(
        &self,
        id: ConnectionId,
    ) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn contains(
        &self,
        id: ConnectionId,
    ) -> bool {
        self.connections.read().contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Возвращает агрегированную статистику по всем соединениям.
    pub fn global_stats(&self) -> GlobalConnectionStats {
        let connections = self.connections.read();
        let mut stats = GlobalConnectionStats {
            active_connections: connections.len(),
            ..Default::default()
        };

        for connection in connections.values() {
            let s = connection.stats();
            stats.total_frames_sent += s.get_frames_sent();
            stats.total_frames_received += s.get_frames_received();
            stats.total_bytes_sent += s.get_bytes_sent();
            stats.total_bytes_received += s.get_bytes_received();
            stats.total_errors += s.get_errors();
        }
        stats
    }

    /// Закрывает и удаляет все соединения (при остановке процесса).
    ///
    /// # Примечание
    /// Соединения закрываются вне блокировки: обработчики закрытия могут
    /// сами обращаться к реестру.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::network::{
        frame::Frame,
        test_support::{connection_pair, frame_channel, recv_frame, test_executor, wait_until},
    };

    /// Тест проверяет добавление и идемпотентное удаление.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_remove_idempotent() {
        let executor = test_executor();
        let (client, server) = connection_pair(&executor).await;
        let registry = ConnectionRegistry::new();

        assert!(registry.add(client.clone()));
        assert!(!registry.add(client.clone()));
        assert!(registry.add(server.clone()));
        assert_eq!(registry.active_count(), 2);

        assert!(registry.contains(client.id()));
        assert!(registry.contains(server.id()));

        assert!(registry.remove(client.id()).is_some());
        assert!(registry.remove(client.id()).is_none());
        assert!(!registry.contains(client.id()));
        assert!(registry.get(server.id()).is_some());

        // Удаление не закрывает соединение.
        assert!(client.is_open());
    }

    /// Тест проверяет удаление из обработчика закрытия, который может
    /// сработать параллельно с явным удалением.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_from_close_handler() {
        let executor = test_executor();
        let (client, _server) = connection_pair(&executor).await;
        let registry = Arc::new(ConnectionRegistry::new());
        registry.add(client.clone());

        let weak = Arc::downgrade(&registry);
        client.on_close(Box::new(move |id| {
            if let Some(registry) = weak.upgrade() {
                registry.remove(id);
            }
        }));

        registry.remove(client.id());
        client.close();
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_global_stats() {
        let executor = test_executor();
        let (client, server) = connection_pair(&executor).await;
        let (handler, mut rx) = frame_channel();
        server.start_read_loop(handler).unwrap();

        let registry = ConnectionRegistry::new();
        registry.add(client.clone());
        registry.add(server.clone());

        client
            .enqueue_frame(&Frame::new("ping", Bytes::from_static(b"abc")))
            .unwrap();
        recv_frame(&mut rx).await;
        assert!(wait_until(|| registry.global_stats().total_frames_sent == 1).await);

        let stats = registry.global_stats();
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.total_frames_received, 1);
        assert_eq!(stats.total_bytes_sent, stats.total_bytes_received);
        assert_eq!(stats.total_errors, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_all() {
        let executor = test_executor();
        let (client, server) = connection_pair(&executor).await;
        let registry = ConnectionRegistry::new();
        registry.add(client.clone());
        registry.add(server.clone());

        registry.close_all();
        assert_eq!(registry.active_count(), 0);
        assert!(!client.is_open());
        assert!(!server.is_open());
    }
}
