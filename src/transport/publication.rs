use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use simbus_error::DeliveryError;
use tracing::{debug, warn};

use super::subscription_transport::SubscriptionTransport;
use crate::network::{
    connection_state::ConnectionId,
    protocol::{OutgoingMessage, RawMessage},
};

/// Параметры объявления топика.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvertiseOptions {
    /// Сохранять последнее сообщение и отдавать его каждому новому
    /// подписчику.
    pub latch: bool,
}

/// Публикация одного топика на узле: список транспортов подписчиков и
/// (при latch) последнее сообщение.
pub struct Publication {
    topic: String,
    type_tag: String,
    latch: bool,
    transports: RwLock<Vec<Arc<SubscriptionTransport>>>,
    /// Упорядочивает повтор последнего сообщения относительно `publish`.
    /// Повторный вход нужен локальному обработчику, который публикует из
    /// обратного вызова.
    latch_gate: ReentrantMutex<()>,
    last: Mutex<Option<RawMessage>>,
    publishers: AtomicUsize,
}

impl Publication {
    pub fn new(
        topic: impl Into<String>,
        type_tag: impl Into<String>,
        options: AdvertiseOptions,
    ) -> Self {
        Self {
            topic: topic.into(),
            type_tag: type_tag.into(),
            latch: options.latch,
            transports: RwLock::new(Vec::new()),
            latch_gate: ReentrantMutex::new(()),
            last: Mutex::new(None),
            publishers: AtomicUsize::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn is_latched(&self) -> bool {
        self.latch
    }

    /// Увеличивает счётчик дескрипторов издателя.
    pub fn acquire(&self) -> usize {
        self.publishers.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Уменьшает счётчик дескрипторов издателя.
    ///
    /// # Возвращает
    /// - оставшееся число дескрипторов (0 означает, что топик пора отозвать)
    pub fn release(&self) -> usize {
        let previous = self
            .publishers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.load(Ordering::Acquire)
    }

    /// Добавляет транспорт. Для latch-публикации сразу отдаёт ему последнее
    /// сообщение.
    ///
    /// # Примечание
    /// Повтор и добавление в список идут под `latch_gate`, поэтому
    /// параллельный `publish` либо попадает в повтор, либо доставляется
    /// новому транспорту обычным путём после него.
    pub fn add_transport(
        &self,
        transport: Arc<SubscriptionTransport>,
    ) {
        if !self.latch {
            self.transports.write().push(transport);
            return;
        }

        let _gate = self.latch_gate.lock();
        let last = self.last.lock().clone();
        if let Some(last) = last {
            if let Err(e) = transport.handle_data(&last.type_tag, &last.bytes) {
                debug!(topic = %self.topic, "Latched replay failed: {e}");
            }
        }
        self.transports.write().push(transport);
    }

    pub fn remove_local(
        &self,
        handler_id: u64,
    ) -> bool {
        let mut transports = self.transports.write();
        let before = transports.len();
        transports.retain(|t| t.handler_id() != Some(handler_id));
        transports.len() != before
    }

    /// Убирает все транспорты, привязанные к соединению.
    pub fn remove_connection(
        &self,
        connection_id: ConnectionId,
    ) -> usize {
        let removed: Vec<_> = {
            let mut transports = self.transports.write();
            let (gone, kept): (Vec<_>, Vec<_>) = transports
                .drain(..)
                .partition(|t| t.connection_id() == Some(connection_id));
            *transports = kept;
            gone
        };
        // Транспорты уничтожаются вне блокировки.
        removed.len()
    }

    pub fn remote_connections(&self) -> Vec<ConnectionId> {
        self.transports
            .read()
            .iter()
            .filter_map(|t| t.connection_id())
            .collect()
    }

    pub fn transport_count(&self) -> usize {
        self.transports.read().len()
    }

    pub fn has_remote_subscribers(&self) -> bool {
        self.transports.read().iter().any(|t| !t.is_local())
    }

    /// Доставляет сообщение всем транспортам.
    ///
    /// Транспорты с закрытым соединением удаляются. Сообщение
    /// сериализуется не более одного раза.
    ///
    /// # Возвращает
    /// - число транспортов, принявших сообщение
    pub fn publish(
        &self,
        message: &OutgoingMessage<'_>,
    ) -> usize {
        let transports = if self.latch {
            let _gate = self.latch_gate.lock();
            self.latch(message);
            self.transports.read().clone()
        } else {
            self.transports.read().clone()
        };
        let mut delivered = 0;
        let mut dead = Vec::new();

        for transport in &transports {
            match transport.handle_message(message) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::ConnectionClosed) => {
                    if let Some(id) = transport.connection_id() {
                        dead.push(id);
                    }
                }
                Err(e) => warn!(topic = %self.topic, "Delivery failed: {e}"),
            }
        }
        drop(transports);

        for id in dead {
            debug!(topic = %self.topic, connection = %id, "Dropping closed subscriber");
            self.remove_connection(id);
        }

        delivered
    }

    fn latch(
        &self,
        message: &OutgoingMessage<'_>,
    ) {
        match message.bytes() {
            Ok(bytes) => {
                *self.last.lock() = Some(RawMessage::new(message.type_tag(), bytes));
            }
            Err(e) => warn!(topic = %self.topic, "Failed to latch message: {e}"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
