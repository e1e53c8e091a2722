use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use simbus_error::NetworkError;
use tracing::{debug, info, warn};

use super::registry::TopicRegistry;
use crate::network::{
    connection::{Connection, ConnectionConfig, FrameHandler},
    connection_registry::ConnectionRegistry,
    connection_state::ConnectionId,
    executor::IoExecutor,
    frame::Frame,
    link::FrameLink,
    protocol::{
        ControlMessage, PublishAnnounce, PublisherLocation, SubscribeRequest, PROTOCOL_VERSION,
    },
    server::{AcceptHandler, Server},
};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:11345";

/// Что делать с подписчиком, который пришёл раньше издателя.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateSubscriberPolicy {
    /// Издатели сообщаются только в ответ на `subscribe`.
    #[default]
    RequestTimeOnly,
    /// Новый издатель дополнительно рассылается всем текущим подписчикам
    /// топика кадром `publisher_advertise`.
    NotifyOnAnnounce,
}

/// Параметры брокера.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Адрес слушающего сокета
    pub listen: String,
    pub late_subscriber_policy: LateSubscriberPolicy,
    /// Параметры принимаемых соединений
    pub connection: ConnectionConfig,
}

/// Брокер: принимает соединения узлов и сводит издателей с подписчиками.
///
/// Сам брокер данные топиков не передаёт. Он лишь отвечает подписчику
/// адресами издателей, после чего узлы соединяются напрямую. Кроме того,
/// каждый клиент получает полный список издателей при подключении и
/// изменения этого списка по ходу работы.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    executor: IoExecutor,
    topics: Mutex<TopicRegistry>,
    /// Все клиенты, получившие приветствие. Рассылки идут под `topics`.
    clients: DashMap<ConnectionId, Weak<dyn FrameLink>>,
    connections: ConnectionRegistry,
    server: Mutex<Option<Server>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Broker {
    pub fn new(
        config: BrokerConfig,
        executor: &IoExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                executor: executor.clone(),
                topics: Mutex::new(TopicRegistry::new()),
                clients: DashMap::new(),
                connections: ConnectionRegistry::new(),
                server: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Привязывает слушающий сокет и начинает принимать соединения.
    ///
    /// # Возвращает
    /// - фактический адрес сокета (полезно при порте `0`)
    /// - `NetworkError::AlreadyStarted`, если брокер уже запущен
    pub async fn start(&self) -> Result<SocketAddr, NetworkError> {
        if self.inner.server.lock().is_some() {
            return Err(NetworkError::AlreadyStarted);
        }

        let server = Server::bind(
            &self.inner.config.listen,
            &self.inner.executor,
            self.inner.config.connection.clone(),
        )
        .await?;
        let local_addr = server.local_addr();

        let mut slot = self.inner.server.lock();
        if slot.is_some() {
            return Err(NetworkError::AlreadyStarted);
        }

        let weak = Arc::downgrade(&self.inner);
        let on_accept: AcceptHandler = Arc::new(move |connection| match weak.upgrade() {
            Some(inner) => inner.accept(connection),
            None => connection.close(),
        });
        server.serve(on_accept)?;
        *slot = Some(server);

        info!(
            address = %local_addr,
            version = PROTOCOL_VERSION,
            policy = ?self.inner.config.late_subscriber_policy,
            "Broker started"
        );
        Ok(local_addr)
    }

    /// Останавливает приём, закрывает все клиентские соединения и очищает
    /// реестр. Повторный вызов ничего не делает.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .server
            .lock()
            .as_ref()
            .is_some_and(Server::is_serving)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.lock().as_ref().map(Server::local_addr)
    }

    /// Открытые издатели топика.
    pub fn publishers(
        &self,
        topic: &str,
    ) -> Vec<PublisherLocation> {
        self.inner.topics.lock().publishers_for(topic)
    }

    pub fn publisher_count(&self) -> usize {
        self.inner.topics.lock().publisher_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.topics.lock().subscriber_count()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.active_count()
    }

    /// Все открытые издатели, как их видит новый клиент.
    pub fn all_publishers(&self) -> Vec<PublisherLocation> {
        self.inner.topics.lock().all_publishers()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.inner.topics.lock().namespaces().to_vec()
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.lock().topics()
    }
}

impl BrokerInner {
    fn accept(
        self: Arc<Self>,
        connection: Arc<Connection>,
    ) {
        self.connections.add(connection.clone());

        let link: Arc<dyn FrameLink> = connection.clone();
        self.attach_link(&link);

        let weak: Weak<BrokerInner> = Arc::downgrade(&self);
        let on_frame: FrameHandler = Arc::new(move |connection, frame| {
            if let Some(inner) = weak.upgrade() {
                let link: Arc<dyn FrameLink> = connection.clone();
                inner.handle_frame(&link, &frame);
            }
        });

        if let Err(e) = connection.start_read_loop(on_frame) {
            warn!(connection = %connection.id(), "Failed to start read loop: {e}");
            connection.close();
        }
    }

    fn attach_link(
        self: &Arc<Self>,
        link: &Arc<dyn FrameLink>,
    ) {
        let id = link.id();
        info!(connection = %id, peer = ?link.peer_addr(), "Client connected");

        {
            // Под блокировкой: ни одно изменение списка издателей не
            // проскочит между снимком и регистрацией клиента.
            let topics = self.topics.lock();
            let namespaces = topics.namespaces().to_vec();
            send_control(link, &ControlMessage::VersionInit(PROTOCOL_VERSION.to_string()));
            send_control(link, &ControlMessage::TopicNamespacesInit(namespaces));
            send_control(link, &ControlMessage::PublishersInit(topics.all_publishers()));
            self.clients.insert(id, Arc::downgrade(link));
        }

        let weak = Arc::downgrade(self);
        link.on_close(Box::new(move |id| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_close(id);
            }
        }));
    }

    fn handle_frame(
        &self,
        link: &Arc<dyn FrameLink>,
        frame: &Frame,
    ) {
        let message = match ControlMessage::from_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    connection = %link.id(),
                    tag = frame.tag(),
                    "Ignoring undecodable control frame: {e}"
                );
                return;
            }
        };

        match message {
            ControlMessage::Advertise(announce) => self.handle_advertise(link, announce),
            ControlMessage::Subscribe(request) => self.handle_subscribe(link, request),
            ControlMessage::Unadvertise(announce) => {
                let removed = {
                    let mut topics = self.topics.lock();
                    let removed = topics.withdraw(&announce, link.id());
                    if removed {
                        self.broadcast(&ControlMessage::PublisherDel(announce.clone().into()));
                    }
                    removed
                };
                debug!(
                    connection = %link.id(),
                    topic = %announce.topic,
                    removed,
                    "Publisher withdrawn"
                );
            }
            ControlMessage::Unsubscribe(request) => {
                let removed = self.topics.lock().unsubscribe(&request, link.id());
                debug!(
                    connection = %link.id(),
                    topic = %request.topic,
                    removed,
                    "Subscriber removed"
                );
            }
            ControlMessage::RegisterTopicNamespace(namespace) => {
                self.handle_register_namespace(link, namespace)
            }
            other => warn!(
                connection = %link.id(),
                tag = other.tag(),
                "Ignoring message the broker does not accept"
            ),
        }
    }

    fn handle_advertise(
        &self,
        link: &Arc<dyn FrameLink>,
        announce: PublishAnnounce,
    ) {
        let location = PublisherLocation::from(announce.clone());
        let notify = {
            let mut topics = self.topics.lock();
            let inserted = topics.announce(announce, link);
            if !link.is_open() {
                // Закрытие могло опередить кадр: записи не должны пережить
                // соединение.
                self.purge_and_broadcast(&mut topics, link.id());
                return;
            }
            if !inserted {
                Vec::new()
            } else {
                self.broadcast(&ControlMessage::PublisherAdd(location.clone()));
                match self.config.late_subscriber_policy {
                    LateSubscriberPolicy::NotifyOnAnnounce => topics.subscribers_for(&location.topic),
                    LateSubscriberPolicy::RequestTimeOnly => Vec::new(),
                }
            }
        };

        info!(
            connection = %link.id(),
            topic = %location.topic,
            type_tag = %location.type_tag,
            endpoint = %location.endpoint,
            "Publisher announced"
        );

        if notify.is_empty() {
            return;
        }
        let frame = match ControlMessage::PublisherAdvertise(location).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %link.id(), "Failed to encode publisher_advertise: {e}");
                return;
            }
        };
        for subscriber in notify {
            if let Err(e) = subscriber.link.send_frame(&frame) {
                debug!(connection = %subscriber.connection, "Notify skipped: {e}");
            }
        }
    }

    fn handle_subscribe(
        &self,
        link: &Arc<dyn FrameLink>,
        request: SubscribeRequest,
    ) {
        let topic = request.topic.clone();
        let publishers = {
            let mut topics = self.topics.lock();
            topics.subscribe(request, link);
            if !link.is_open() {
                self.purge_and_broadcast(&mut topics, link.id());
                return;
            }
            topics.publishers_for(&topic)
        };

        info!(
            connection = %link.id(),
            topic = %topic,
            publishers = publishers.len(),
            "Subscriber registered"
        );

        for location in publishers {
            if !send_control(link, &ControlMessage::PublisherSubscribe(location)) {
                break;
            }
        }
    }

    fn handle_register_namespace(
        &self,
        link: &Arc<dyn FrameLink>,
        namespace: String,
    ) {
        let mut topics = self.topics.lock();
        if !topics.register_namespace(&namespace) {
            return;
        }
        info!(connection = %link.id(), namespace = %namespace, "Topic namespace registered");
        self.broadcast(&ControlMessage::TopicNamespaceAdd(namespace));
    }

    fn handle_close(
        &self,
        id: ConnectionId,
    ) {
        self.clients.remove(&id);
        let (publishers, subscribers) = {
            let mut topics = self.topics.lock();
            self.purge_and_broadcast(&mut topics, id)
        };
        self.connections.remove(id);
        info!(
            connection = %id,
            publishers,
            subscribers,
            "Client disconnected"
        );
    }

    /// Удаляет записи соединения и сообщает клиентам об ушедших издателях.
    ///
    /// # Возвращает
    /// - `(издателей, подписчиков)` удалено
    fn purge_and_broadcast(
        &self,
        topics: &mut TopicRegistry,
        id: ConnectionId,
    ) -> (usize, usize) {
        let (publishers, subscribers) = topics.purge_connection(id);
        for location in &publishers {
            self.broadcast(&ControlMessage::PublisherDel(location.clone()));
        }
        (publishers.len(), subscribers)
    }

    /// Отправляет сообщение всем клиентам.
    ///
    /// # Примечание
    /// Вызывается под блокировкой `topics`, чтобы рассылки и снимок в
    /// `attach_link` шли в одном порядке.
    fn broadcast(
        &self,
        message: &ControlMessage,
    ) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(tag = message.tag(), "Failed to encode broadcast: {e}");
                return;
            }
        };
        for client in self.clients.iter() {
            let Some(link) = client.value().upgrade() else {
                continue;
            };
            if let Err(e) = link.send_frame(&frame) {
                debug!(connection = %client.key(), tag = message.tag(), "Broadcast skipped: {e}");
            }
        }
    }

    fn stop(&self) {
        let server = self.server.lock().take();
        let Some(server) = server else {
            return;
        };
        server.stop();

        let stats = self.connections.global_stats();
        self.connections.close_all();
        self.clients.clear();
        self.topics.lock().clear();
        info!(
            connections = stats.active_connections,
            frames_received = stats.total_frames_received,
            frames_sent = stats.total_frames_sent,
            errors = stats.total_errors,
            "Broker stopped"
        );
    }
}

/// Отправляет управляющее сообщение.
///
/// # Возвращает
/// - `false`, если сообщение не ушло
fn send_control(
    link: &Arc<dyn FrameLink>,
    message: &ControlMessage,
) -> bool {
    let frame = match message.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %link.id(), tag = message.tag(), "Failed to encode: {e}");
            return false;
        }
    };
    match link.send_frame(&frame) {
        Ok(()) => true,
        Err(e) => {
            debug!(connection = %link.id(), tag = message.tag(), "Send skipped: {e}");
            false
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            late_subscriber_policy: LateSubscriberPolicy::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("listen", &self.inner.config.listen)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .field("topics", &*self.inner.topics.lock())
            .finish()
    }
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        self.stop();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
