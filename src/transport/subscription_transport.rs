use std::{
    fmt,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use simbus_error::DeliveryError;
use tracing::trace;

use crate::network::{
    connection_registry::ConnectionRegistry,
    connection_state::ConnectionId,
    frame::Frame,
    link::FrameLink,
    protocol::{IncomingMessage, MessageHandler, OutgoingMessage},
};

/// Привязка одного подписчика к публикации.
///
/// Удалённый транспорт превращает «доставить сообщение» в «поставить кадр в
/// очередь соединения». Локальный транспорт вызывает обработчик того же
/// процесса напрямую и не сериализует значение.
pub struct SubscriptionTransport {
    topic: String,
    mode: TransportMode,
}

enum TransportMode {
    Local {
        handler_id: u64,
        handler: MessageHandler,
    },
    Remote {
        link: Weak<dyn FrameLink>,
        connection_id: ConnectionId,
        registry: Arc<ConnectionRegistry>,
    },
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl SubscriptionTransport {
    /// Привязывает транспорт к соединению подписчика.
    ///
    /// Транспорт не владеет соединением: оно может обслуживать и другие
    /// транспорты.
    pub fn init(
        topic: impl Into<String>,
        link: &Arc<dyn FrameLink>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            topic: topic.into(),
            mode: TransportMode::Remote {
                link: Arc::downgrade(link),
                connection_id: link.id(),
                registry,
            },
        }
    }

    /// Транспорт для подписчика в том же процессе.
    pub fn local(
        topic: impl Into<String>,
        handler_id: u64,
        handler: MessageHandler,
    ) -> Self {
        Self {
            topic: topic.into(),
            mode: TransportMode::Local {
                handler_id,
                handler,
            },
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_local(&self) -> bool {
        matches!(self.mode, TransportMode::Local { .. })
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        match &self.mode {
            TransportMode::Remote { connection_id, .. } => Some(*connection_id),
            TransportMode::Local { .. } => None,
        }
    }

    pub fn handler_id(&self) -> Option<u64> {
        match &self.mode {
            TransportMode::Local { handler_id, .. } => Some(*handler_id),
            TransportMode::Remote { .. } => None,
        }
    }

    /// Может ли транспорт ещё доставлять сообщения.
    pub fn is_connected(&self) -> bool {
        match &self.mode {
            TransportMode::Local { .. } => true,
            TransportMode::Remote { link, .. } => {
                link.upgrade().is_some_and(|link| link.is_open())
            }
        }
    }

    /// Доставляет одно сообщение.
    ///
    /// # Возвращает
    /// - `DeliveryError::ConnectionClosed`, если соединение не было открыто
    ///   в момент постановки кадра в очередь
    /// - `DeliveryError::Codec`, если значение не сериализуется
    pub fn handle_message(
        &self,
        message: &OutgoingMessage<'_>,
    ) -> Result<(), DeliveryError> {
        match &self.mode {
            TransportMode::Local { handler, .. } => {
                handler(&IncomingMessage::Local(message));
                Ok(())
            }
            TransportMode::Remote { .. } => {
                let link = self.open_link()?;
                let bytes = message.bytes()?;
                link.send_frame(&Frame::new(message.type_tag(), bytes))?;
                trace!(topic = %self.topic, connection = %link.id(), "Message enqueued");
                Ok(())
            }
        }
    }

    /// Доставляет уже сериализованную полезную нагрузку (например,
    /// сохранённое latch-сообщение).
    pub fn handle_data(
        &self,
        type_tag: &str,
        bytes: &Bytes,
    ) -> Result<(), DeliveryError> {
        match &self.mode {
            TransportMode::Local { handler, .. } => {
                handler(&IncomingMessage::Remote { type_tag, bytes });
                Ok(())
            }
            TransportMode::Remote { .. } => {
                let link = self.open_link()?;
                link.send_frame(&Frame::new(type_tag, bytes.clone()))?;
                Ok(())
            }
        }
    }

    fn open_link(&self) -> Result<Arc<dyn FrameLink>, DeliveryError> {
        let TransportMode::Remote { link, .. } = &self.mode else {
            return Err(DeliveryError::ConnectionClosed);
        };
        match link.upgrade() {
            Some(link) if link.is_open() => Ok(link),
            _ => Err(DeliveryError::ConnectionClosed),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl fmt::Debug for SubscriptionTransport {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let mut s = f.debug_struct("SubscriptionTransport");
        s.field("topic", &self.topic);
        match &self.mode {
            TransportMode::Local { handler_id, .. } => s.field("local_handler", handler_id),
            TransportMode::Remote { connection_id, .. } => s.field("connection", connection_id),
        };
        s.finish()
    }
}

impl Drop for SubscriptionTransport {
    fn drop(&mut self) {
        if let TransportMode::Remote {
            connection_id,
            registry,
            ..
        } = &self.mode
        {
            registry.remove(*connection_id);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
