use std::net::SocketAddr;

use simbus_error::NetworkError;

use super::{connection_state::ConnectionId, frame::Frame};

/// Обработчик закрытия соединения. Вызывается ровно один раз.
pub type CloseHandler = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

/// Минимальные возможности соединения, нужные брокеру и транспорту
/// подписки.
///
/// Реализуется [`Connection`](super::connection::Connection). Брокер и
/// транспорт подписки зависят только от этого трейта.
pub trait FrameLink: Send + Sync {
    /// Идентификатор соединения.
    fn id(&self) -> ConnectionId;

    /// Ставит кадр в очередь на отправку.
    ///
    /// # Возвращает
    /// - `NetworkError::ConnectionClosed`, если соединение уже закрыто
    fn send_frame(
        &self,
        frame: &Frame,
    ) -> Result<(), NetworkError>;

    /// Открыто ли соединение (проверка без гарантий, ответ `send_frame`
    /// окончателен).
    fn is_open(&self) -> bool;

    /// Регистрирует обработчик закрытия. Если соединение уже закрыто,
    /// обработчик вызывается сразу.
    fn on_close(
        &self,
        handler: CloseHandler,
    );

    /// Адрес удалённой стороны.
    fn peer_addr(&self) -> Option<SocketAddr>;
}
