use std::{
    fmt,
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use simbus_error::NetworkError;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    task::AbortHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{
    connection_state::{ConnectionId, ConnectionState, ConnectionStats},
    endpoint::Endpoint,
    executor::IoExecutor,
    frame::{Frame, FrameDecoder, FrameEncoder, DEFAULT_MAX_FRAME_LEN},
    link::{CloseHandler, FrameLink},
};

/// Минимум свободного места в буфере чтения перед очередным `read_buf`.
const MIN_READ_SPACE: usize = 1024;

/// Обработчик входящих кадров. Вызывается на задаче исполнителя.
pub type FrameHandler = Arc<dyn Fn(&Arc<Connection>, Frame) + Send + Sync + 'static>;

/// Параметры соединения.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Таймаут установки исходящего соединения
    pub connect_timeout_ms: u64,
    /// Максимальный размер тела кадра
    pub max_frame_len: usize,
    /// Начальный размер буфера чтения
    pub read_buffer_size: usize,
}

/// Причина закрытия соединения (для логов).
#[derive(Debug)]
enum CloseReason {
    Local,
    Dropped,
    PeerClosed,
    ReadError(String),
    WriteError(String),
    Malformed(String),
}

/// Одно постоянное двунаправленное TCP-соединение с кадровым обменом.
///
/// Чтение выполняет отдельная задача, которая собирает кадры из потока и
/// передаёт каждый в [`FrameHandler`]. Запись выполняет другая задача,
/// разбирающая очередь исходящих кадров по порядку. Очередь принимает кадры
/// только пока соединение открыто.
///
/// Обработчики закрытия срабатывают ровно один раз: при ошибке потока,
/// штатном закрытии удалённой стороной, повреждённом кадре или явном
/// [`Connection::close`].
pub struct Connection {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    config: ConnectionConfig,
    executor: IoExecutor,
    encoder: FrameEncoder,
    open: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    read_task: Mutex<Option<AbortHandle>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    stats: ConnectionStats,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Connection {
    /// Устанавливает исходящее соединение.
    ///
    /// # Возвращает
    /// - `NetworkError::ConnectionFailed`, если удалённая сторона недоступна
    /// - `NetworkError::ConnectionTimeout`, если не уложились в таймаут
    pub async fn connect(
        endpoint: &Endpoint,
        executor: &IoExecutor,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>, NetworkError> {
        let address = endpoint.to_string();
        let stream = match timeout(config.connect_timeout(), TcpStream::connect(address.as_str()))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Connect to {address} failed: {e}");
                return Err(NetworkError::ConnectionFailed {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(NetworkError::ConnectionTimeout { address }),
        };

        Self::from_stream(stream, executor, config)
    }

    /// Оборачивает принятый или установленный поток и запускает задачу
    /// записи. Чтение начинается только после [`Connection::start_read_loop`].
    pub fn from_stream(
        stream: TcpStream,
        executor: &IoExecutor,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>, NetworkError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {remote_addr}: {e}");
        }

        let (reader, writer) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ConnectionId::next();

        let connection = Arc::new(Self {
            id,
            local_addr,
            remote_addr,
            encoder: FrameEncoder::new(config.max_frame_len),
            config,
            executor: executor.clone(),
            open: AtomicBool::new(true),
            outbound: Mutex::new(Some(sender)),
            reader: Mutex::new(Some(reader)),
            read_task: Mutex::new(None),
            close_handlers: Mutex::new(Vec::new()),
            stats: ConnectionStats::new(),
        });

        executor.spawn(write_loop(
            id,
            Arc::downgrade(&connection),
            writer,
            receiver,
        ))?;

        debug!(
            connection = %id,
            local = %local_addr,
            remote = %remote_addr,
            "Connection established"
        );
        Ok(connection)
    }

    /// Запускает непрерывное асинхронное чтение кадров.
    ///
    /// Задача чтения удерживает соединение живым, пока поток открыт.
    ///
    /// # Возвращает
    /// - `NetworkError::AlreadyStarted` при повторном вызове
    /// - `NetworkError::ConnectionClosed`, если соединение уже закрыто
    pub fn start_read_loop(
        self: &Arc<Self>,
        on_frame: FrameHandler,
    ) -> Result<(), NetworkError> {
        let reader = match self.reader.lock().take() {
            Some(reader) => reader,
            None if self.is_open() => return Err(NetworkError::AlreadyStarted),
            None => return Err(NetworkError::ConnectionClosed),
        };

        let task = match self
            .executor
            .spawn(read_loop(Arc::clone(self), reader, on_frame))
        {
            Ok(task) => task,
            Err(e) => {
                self.shutdown(CloseReason::ReadError(e.to_string()));
                return Err(e.into());
            }
        };

        *self.read_task.lock() = Some(task.abort_handle());
        if !self.is_open() {
            task.abort();
        }
        Ok(())
    }

    /// Ставит кадр в очередь на отправку.
    ///
    /// Кадры одного отправителя уходят в сокет в порядке постановки и
    /// никогда не перемешиваются байтами с кадрами других отправителей.
    ///
    /// # Возвращает
    /// - `NetworkError::ConnectionClosed`, если соединение закрыто
    /// - `NetworkError::Frame`, если кадр нельзя закодировать
    pub fn enqueue_frame(
        &self,
        frame: &Frame,
    ) -> Result<(), NetworkError> {
        if !self.is_open() {
            return Err(NetworkError::ConnectionClosed);
        }
        let encoded = self.encoder.encode(frame)?;

        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(sender) => sender
                .send(encoded)
                .map_err(|_| NetworkError::ConnectionClosed),
            None => Err(NetworkError::ConnectionClosed),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_open() {
            ConnectionState::Connected
        } else {
            ConnectionState::Closed
        }
    }

    /// Закрывает соединение. Повторный вызов ничего не делает.
    ///
    /// Уже поставленные в очередь кадры дописываются в сокет (best-effort),
    /// после чего запись завершается.
    pub fn close(&self) {
        self.shutdown(CloseReason::Local);
    }

    /// Регистрирует обработчик закрытия.
    ///
    /// # Примечание
    /// Если соединение уже закрыто, обработчик вызывается немедленно в
    /// текущем потоке.
    pub fn on_close(
        &self,
        handler: CloseHandler,
    ) {
        let mut handlers = self.close_handlers.lock();
        if self.is_open() {
            handlers.push(handler);
            return;
        }
        drop(handlers);
        handler(self.id);
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    fn shutdown(
        &self,
        reason: CloseReason,
    ) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        // Без отправителя задача записи дописывает очередь и закрывает сокет.
        drop(self.outbound.lock().take());
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        drop(self.reader.lock().take());

        match &reason {
            CloseReason::Local | CloseReason::Dropped | CloseReason::PeerClosed => {
                debug!(connection = %self.id, remote = %self.remote_addr, "Connection closed: {reason}")
            }
            CloseReason::ReadError(_) | CloseReason::WriteError(_) => {
                info!(connection = %self.id, remote = %self.remote_addr, "Connection closed: {reason}")
            }
            CloseReason::Malformed(_) => {
                warn!(connection = %self.id, remote = %self.remote_addr, "Connection closed: {reason}")
            }
        }

        let handlers = std::mem::take(&mut *self.close_handlers.lock());
        for handler in handlers {
            handler(self.id);
        }
    }
}

async fn read_loop(
    connection: Arc<Connection>,
    mut reader: OwnedReadHalf,
    on_frame: FrameHandler,
) {
    let read_buffer_size = connection.config.read_buffer_size.max(MIN_READ_SPACE);
    let mut decoder = FrameDecoder::new(connection.config.max_frame_len);
    let mut buf = BytesMut::with_capacity(read_buffer_size);

    let reason = loop {
        if buf.capacity() - buf.len() < MIN_READ_SPACE {
            buf.reserve(read_buffer_size);
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => break CloseReason::PeerClosed,
            Ok(n) => {
                connection.stats.record_bytes_received(n);
                loop {
                    match decoder.decode(&mut buf) {
                        Ok(Some(frame)) => {
                            connection.stats.record_frame_received();
                            on_frame(&connection, frame);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            connection.stats.record_error();
                            connection.shutdown(CloseReason::Malformed(e.to_string()));
                            return;
                        }
                    }
                }
                if !connection.is_open() {
                    return;
                }
            }
            Err(e) => {
                if !is_recoverable_error(&e) {
                    connection.stats.record_error();
                }
                break CloseReason::ReadError(e.to_string());
            }
        }
    };

    connection.shutdown(reason);
}

async fn write_loop(
    id: ConnectionId,
    connection: Weak<Connection>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(encoded) = outbound.recv().await {
        if let Err(e) = writer.write_all(&encoded).await {
            if let Some(connection) = connection.upgrade() {
                connection.stats.record_error();
                connection.shutdown(CloseReason::WriteError(e.to_string()));
            }
            return;
        }
        if let Some(connection) = connection.upgrade() {
            connection.stats.record_sent(encoded.len());
        }
    }

    graceful_close_writer(id, writer).await;
}

/// Ошибки, которые означают обычный обрыв связи, а не сбой.
fn is_recoverable_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
    )
}

async fn graceful_close_writer(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
) {
    if let Err(e) = writer.shutdown().await {
        if e.kind() != ErrorKind::NotConnected {
            debug!(connection = %id, "Error during shutdown: {e}");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Dropped => write!(f, "dropped"),
            Self::PeerClosed => write!(f, "peer closed the stream"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::WriteError(e) => write!(f, "write error: {e}"),
            Self::Malformed(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl FrameLink for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_frame(
        &self,
        frame: &Frame,
    ) -> Result<(), NetworkError> {
        self.enqueue_frame(frame)
    }

    fn is_open(&self) -> bool {
        Connection::is_open(self)
    }

    fn on_close(
        &self,
        handler: CloseHandler,
    ) {
        Connection::on_close(self, handler)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown(CloseReason::Dropped);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;
    use crate::network::test_support::{
        connection_pair, connection_pair_with_config, frame_channel, noop_handler, recv_frame,
        test_executor, wait_until,
    };

    /// Тест проверяет доставку кадров в обе стороны в порядке отправки.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_flow_both_ways() {
        let executor = test_executor();
        let (client, server) = connection_pair(&executor).await;

        let (server_handler, mut server_rx) = frame_channel();
        let (client_handler, mut client_rx) = frame_channel();
        server.start_read_loop(server_handler).unwrap();
        client.start_read_loop(client_handler).unwrap();

        for i in 0..3u8 {
            client
                .enqueue_frame(&Frame::new("ping", vec![i]))
                .unwrap();
        }
        for i in 0..3u8 {
            let frame = recv_frame(&mut server_rx).await;
            assert_eq!(frame.tag(), "ping");
            assert_eq!(&frame.payload()[..], &[i]);
        }

        server
            .enqueue_frame(&Frame::new("pong", Bytes::new()))
            .unwrap();
        assert_eq!(recv_frame(&mut client_rx).await.tag(), "pong");

        assert!(wait_until(|| client.stats().get_frames_sent() == 3).await);
        assert_eq!(server.stats().get_frames_received(), 3);
    }

    /// Тест проверяет, что параллельные отправители не портят поток:
    /// каждый кадр приходит целым и в порядке своего отправителя.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_keeps_frames_intact() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 50;

        let executor = test_executor();
        let (client, server) = connection_pair(&executor).await;
        let (handler, mut rx) = frame_channel();
        server.start_read_loop(handler).unwrap();

        let mut producers = Vec::new();
        for producer in 0..PRODUCERS {
            let client = client.clone();
            producers.push(tokio::spawn(async move {
                for seq in 0..PER_PRODUCER {
                    let payload = format!("{producer}:{seq}:{}", "x".repeat(seq * 10));
                    client
                        .enqueue_frame(&Frame::new("data", payload.into_bytes()))
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut last_seen: HashMap<usize, usize> = HashMap::new();
        for _ in 0..PRODUCERS * PER_PRODUCER {
            let frame = recv_frame(&mut rx).await;
            let text = std::str::from_utf8(frame.payload()).unwrap();
            let mut parts = text.splitn(3, ':');
            let producer: usize = parts.next().unwrap().parse().unwrap();
            let seq: usize = parts.next().unwrap().parse().unwrap();
            assert_eq!(parts.next().unwrap(), "x".repeat(seq * 10));

            if let Some(previous) = last_seen.insert(producer, seq) {
                assert_eq!(seq, previous + 1, "producer {producer} reordered");
            } else {
                assert_eq!(seq, 0);
            }
        }
    }

    /// Тест проверяет, что после закрытия очередь отклоняет кадры.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enqueue_after_close_fails() {
        let executor = test_executor();
        let (client, _server) = connection_pair(&executor).await;

        client.close();
        client.close();

        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.enqueue_frame(&Frame::new("ping", Bytes::new())),
            Err(NetworkError::ConnectionClosed)
        ));
        assert!(matches!(
            client.start_read_loop(noop_handler()),
            Err(NetworkError::ConnectionClosed)
        ));
    }

    /// Тест проверяет, что кадры, поставленные в очередь до `close`, всё
    /// равно доходят до удалённой стороны.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_flushes_queued_frames() {
        let executor = test_executor();
        let (client, server) = connection_pair(&executor).await;
        let (handler, mut rx) = frame_channel();
        server.start_read_loop(handler).unwrap();

        for i in 0..50u8 {
            client
                .enqueue_frame(&Frame::new("data", vec![i; 512]))
                .unwrap();
        }
        client.close();

        for i in 0..50u8 {
            let frame = recv_frame(&mut rx).await;
            assert_eq!(&frame.payload()[..], &[i; 512][..]);
        }
        assert!(wait_until(|| !server.is_open()).await);
    }

    /// Тест проверяет, что обработчик закрытия срабатывает ровно один раз,
    /// даже если закрытие пришло и от удалённой стороны, и локально.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_handler_fires_exactly_once() {
        let executor = test_executor();
        let (client, server) = connection_pair(&executor).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        client.on_close(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        client.start_read_loop(noop_handler()).unwrap();

        server.close();
        assert!(wait_until(|| !client.is_open()).await);
        client.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Поздняя регистрация срабатывает сразу.
        let counter = fired.clone();
        client.on_close(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    /// Тест проверяет, что повреждённый кадр закрывает соединение без
    /// попытки ресинхронизации.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_frame_closes_connection() {
        let executor = test_executor();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut raw = raw.unwrap();
        let (stream, _) = accepted.unwrap();

        let server = Connection::from_stream(stream, &executor, ConnectionConfig::default()).unwrap();
        let (handler, _rx) = frame_channel();
        server.start_read_loop(handler).unwrap();

        // Длина 4, длина тега 10: тег не помещается в тело.
        raw.write_all(&[0, 0, 0, 4, 0, 10, b'a', b'b']).await.unwrap();

        assert!(wait_until(|| !server.is_open()).await);
        assert_eq!(server.stats().get_errors(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_loop_cannot_start_twice() {
        let executor = test_executor();
        let (client, _server) = connection_pair(&executor).await;

        client.start_read_loop(noop_handler()).unwrap();
        assert!(matches!(
            client.start_read_loop(noop_handler()),
            Err(NetworkError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_reported() {
        let executor = test_executor();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Connection::connect(
            &Endpoint::new("127.0.0.1", port),
            &executor,
            ConnectionConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetworkError::ConnectionFailed { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_frame_is_rejected() {
        let executor = test_executor();
        let config = ConnectionConfig {
            max_frame_len: 32,
            ..Default::default()
        };
        let (client, _server) = connection_pair_with_config(&executor, config).await;

        let err = client
            .enqueue_frame(&Frame::new("data", vec![0u8; 64]))
            .unwrap_err();
        assert!(matches!(err, NetworkError::Frame(_)));
        assert!(client.is_open());
    }
}
