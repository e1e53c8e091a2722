use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use simbus_error::NetworkError;
use tokio::{net::TcpListener, task::AbortHandle};
use tracing::{debug, info, warn};

use super::{
    connection::{Connection, ConnectionConfig},
    executor::IoExecutor,
};

/// Пауза после неудачного `accept`, чтобы не крутить цикл впустую
/// (например, при исчерпании файловых дескрипторов).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Обработчик нового входящего соединения.
pub type AcceptHandler = Arc<dyn Fn(Arc<Connection>) + Send + Sync + 'static>;

/// Слушающий сокет, превращающий входящие потоки в [`Connection`].
///
/// Привязка и запуск приёма разделены: адрес известен сразу после
/// [`Server::bind`], а обработчик можно установить позже через
/// [`Server::serve`].
pub struct Server {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<AbortHandle>>,
    executor: IoExecutor,
    config: ConnectionConfig,
}

impl Server {
    /// Привязывает слушающий сокет.
    pub async fn bind(
        addr: &str,
        executor: &IoExecutor,
        config: ConnectionConfig,
    ) -> Result<Self, NetworkError> {
        let listener =
            TcpListener::bind(addr)
                .await
                .map_err(|e| NetworkError::ConnectionFailed {
                    address: addr.to_string(),
                    reason: e.to_string(),
                })?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {local_addr}");

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
            executor: executor.clone(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Запускает цикл приёма соединений.
    ///
    /// # Возвращает
    /// - `NetworkError::AlreadyStarted`, если приём уже запущен или сервер
    ///   остановлен
    pub fn serve(
        &self,
        on_accept: AcceptHandler,
    ) -> Result<(), NetworkError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(NetworkError::AlreadyStarted)?;

        let task = self.executor.spawn(accept_loop(
            listener,
            self.executor.clone(),
            self.config.clone(),
            on_accept,
        ))?;
        *self.accept_task.lock() = Some(task.abort_handle());
        Ok(())
    }

    pub fn is_serving(&self) -> bool {
        self.accept_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Прекращает приём. Уже принятые соединения не затрагиваются.
    pub fn stop(&self) {
        drop(self.listener.lock().take());
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
            info!("Stopped listening on {}", self.local_addr);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    executor: IoExecutor,
    config: ConnectionConfig,
    on_accept: AcceptHandler,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => match Connection::from_stream(stream, &executor, config.clone()) {
                Ok(connection) => {
                    debug!(connection = %connection.id(), "Accepted connection from {peer}");
                    on_accept(connection);
                }
                Err(e) => warn!("Failed to set up connection from {peer}: {e}"),
            },
            Err(e) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
