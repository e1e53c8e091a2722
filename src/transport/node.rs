use std::{
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use simbus_error::{NetworkError, TopicError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    publication::{AdvertiseOptions, Publication},
    subscription_transport::SubscriptionTransport,
};
use crate::network::{
    connection::{Connection, ConnectionConfig},
    connection_registry::ConnectionRegistry,
    endpoint::Endpoint,
    executor::IoExecutor,
    frame::Frame,
    link::FrameLink,
    protocol::{
        ControlMessage, DataSubscribe, IncomingMessage, MessageHandler, OutgoingMessage,
        PublishAnnounce, PublisherLocation, RawMessage, SubscribeRequest, TypedMessage,
        PROTOCOL_VERSION,
    },
    server::Server,
};

/// Тег типа подписки, принимающей сообщения любого типа.
pub const ANY_TYPE: &str = "*";

/// Параметры узла.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Адрес брокера
    pub master: Endpoint,
    /// Хост, на котором слушает сервер данных узла
    pub bind_host: String,
    /// Хост, который узел сообщает брокеру; по умолчанию `bind_host`
    pub advertised_host: Option<String>,
    /// Пространство имён для раскрытия `~` в именах топиков
    pub namespace: String,
    /// Число попыток подключения к брокеру
    pub connect_attempts: u32,
    /// Пауза между попытками
    pub retry_interval_ms: u64,
    pub connection: ConnectionConfig,
}

/// Клиентский узел: публикует и подписывается на топики, не раскрывая
/// вызывающему коду ни кадров, ни соединений.
///
/// Узел держит одно управляющее соединение с брокером и собственный сервер
/// данных. Подписчики других узлов подключаются к нему напрямую, данные
/// через брокер не идут.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    executor: IoExecutor,
    endpoint: Endpoint,
    master: Arc<Connection>,
    data_server: Server,
    /// Входящие соединения подписчиков
    registry: Arc<ConnectionRegistry>,
    publications: DashMap<String, Arc<Publication>>,
    subscriptions: DashMap<String, Arc<Subscription>>,
    /// Исходящие соединения к издателям: (топик, адрес издателя)
    remote_links: DashMap<(String, Endpoint), Arc<Connection>>,
    /// Дескрипторы топиков, объявленных через `publish` без `advertise`
    auto_publishers: DashMap<String, Arc<PublisherHandle>>,
    namespaces: RwLock<Vec<String>>,
    /// Список издателей, который ведёт брокер
    publishers: RwLock<Vec<PublisherLocation>>,
    /// Приветствие брокера получено целиком
    greeted: watch::Sender<bool>,
    master_version: RwLock<Option<String>>,
    next_handler_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Подписка узла на один топик: все локальные обработчики.
struct Subscription {
    type_tag: String,
    handlers: RwLock<Vec<(u64, MessageHandler)>>,
}

struct PublisherHandle {
    node: Weak<NodeInner>,
    publication: Arc<Publication>,
}

/// Дескриптор объявленного топика. Последний уничтоженный дескриптор
/// отзывает объявление у брокера.
pub struct Publisher<M> {
    handle: Arc<PublisherHandle>,
    _marker: PhantomData<fn(&M)>,
}

/// Дескриптор подписки. При уничтожении обработчик снимается; последний
/// обработчик топика отменяет подписку у брокера.
pub struct Subscriber {
    node: Weak<NodeInner>,
    topic: String,
    handler_id: u64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl NodeConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    fn advertised_host(&self) -> String {
        match &self.advertised_host {
            Some(host) => host.clone(),
            None if self.bind_host == "0.0.0.0" => "127.0.0.1".to_string(),
            None => self.bind_host.clone(),
        }
    }
}

impl Node {
    /// Подключается к брокеру и поднимает сервер данных.
    ///
    /// Подключение к брокеру повторяется `connect_attempts` раз. После
    /// подключения узел ждёт приветствие брокера со списками пространств
    /// имён и издателей (не дольше таймаута подключения) и регистрирует
    /// своё пространство имён.
    pub async fn connect(
        config: NodeConfig,
        executor: &IoExecutor,
    ) -> Result<Self, TopicError> {
        let data_server = Server::bind(
            &format!("{}:0", config.bind_host),
            executor,
            config.connection.clone(),
        )
        .await?;
        let endpoint = Endpoint::new(config.advertised_host(), data_server.local_addr().port());
        let master = connect_master(&config, executor).await?;

        let (greeted, mut ready) = watch::channel(false);
        let inner = Arc::new(NodeInner {
            config,
            executor: executor.clone(),
            endpoint,
            master,
            data_server,
            registry: Arc::new(ConnectionRegistry::new()),
            publications: DashMap::new(),
            subscriptions: DashMap::new(),
            remote_links: DashMap::new(),
            auto_publishers: DashMap::new(),
            namespaces: RwLock::new(Vec::new()),
            publishers: RwLock::new(Vec::new()),
            greeted,
            master_version: RwLock::new(None),
            next_handler_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.master.on_close(Box::new(move |id| {
            if weak.upgrade().is_some_and(|node| !node.is_shut_down()) {
                warn!(connection = %id, "Lost connection to master");
            }
        }));

        let weak = Arc::downgrade(&inner);
        inner.master.start_read_loop(Arc::new(move |_, frame| {
            if let Some(node) = weak.upgrade() {
                node.handle_master_frame(&frame);
            }
        }))?;

        let weak = Arc::downgrade(&inner);
        inner.data_server.serve(Arc::new(move |connection| {
            if let Some(node) = weak.upgrade() {
                node.accept_subscriber(connection);
            }
        }))?;

        let wait = inner.config.connection.connect_timeout();
        if tokio::time::timeout(wait, ready.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!("Master did not finish its greeting within {wait:?}");
        }

        let namespace = inner.config.namespace.clone();
        if !namespace.is_empty() {
            inner.register_namespace(&namespace)?;
        }

        info!(
            master = %inner.config.master,
            endpoint = %inner.endpoint,
            "Node connected"
        );
        Ok(Self { inner })
    }

    /// Адрес сервера данных, который узел сообщает брокеру.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    /// Версия брокера из `version_init`.
    pub fn master_version(&self) -> Option<String> {
        self.inner.master_version.read().clone()
    }

    pub fn topic_namespaces(&self) -> Vec<String> {
        self.inner.namespaces.read().clone()
    }

    /// Все издатели, известные брокеру, включая издателей этого узла.
    pub fn all_publishers(&self) -> Vec<PublisherLocation> {
        self.inner.publishers.read().clone()
    }

    pub fn register_namespace(
        &self,
        namespace: &str,
    ) -> Result<(), TopicError> {
        self.inner.register_namespace(namespace)
    }

    /// Раскрывает имя топика: `~` заменяется на `/simbus/<namespace>`,
    /// повторные `/` схлопываются.
    pub fn decode_topic_name(
        &self,
        topic: &str,
    ) -> String {
        expand_topic(topic, &self.inner.config.namespace)
    }

    pub fn advertise<M: TypedMessage>(
        &self,
        topic: &str,
    ) -> Result<Publisher<M>, TopicError> {
        self.advertise_with(topic, AdvertiseOptions::default())
    }

    pub fn advertise_with<M: TypedMessage>(
        &self,
        topic: &str,
        options: AdvertiseOptions,
    ) -> Result<Publisher<M>, TopicError> {
        let handle = self.inner.advertise(topic, M::TYPE_TAG, options)?;
        Ok(Publisher {
            handle,
            _marker: PhantomData,
        })
    }

    /// Публикует значение. Если топик ещё не объявлен, объявляет его; такое
    /// объявление живёт до остановки узла.
    ///
    /// # Возвращает
    /// - число подписчиков, принявших сообщение
    pub fn publish<M: TypedMessage>(
        &self,
        topic: &str,
        value: &M,
    ) -> Result<usize, TopicError> {
        let publication = self.inner.publication_for(topic, M::TYPE_TAG)?;
        Ok(publication.publish(&OutgoingMessage::typed(value)))
    }

    /// Публикует уже сериализованную полезную нагрузку.
    pub fn publish_raw(
        &self,
        topic: &str,
        message: RawMessage,
    ) -> Result<usize, TopicError> {
        let publication = self.inner.publication_for(topic, &message.type_tag)?;
        Ok(publication.publish(&OutgoingMessage::raw(&message.type_tag, message.bytes)))
    }

    /// Подписывается на типизированные сообщения топика.
    ///
    /// Сообщения другого типа отбрасываются с предупреждением.
    pub fn subscribe<M, F>(
        &self,
        topic: &str,
        callback: F,
    ) -> Result<Subscriber, TopicError>
    where
        M: TypedMessage,
        F: Fn(&M) + Send + Sync + 'static,
    {
        let name = self.decode_topic_name(topic);
        let handler: MessageHandler = Arc::new(move |message: &IncomingMessage<'_>| {
            if let Err(e) = message.with_typed::<M, _>(|value| callback(value)) {
                warn!(topic = %name, "Dropping message: {e}");
            }
        });
        self.inner.subscribe(topic, M::TYPE_TAG, handler)
    }

    /// Подписывается на сообщения любого типа в виде байтов.
    pub fn subscribe_raw<F>(
        &self,
        topic: &str,
        callback: F,
    ) -> Result<Subscriber, TopicError>
    where
        F: Fn(RawMessage) + Send + Sync + 'static,
    {
        let name = self.decode_topic_name(topic);
        let handler: MessageHandler =
            Arc::new(move |message: &IncomingMessage<'_>| match message.bytes() {
                Ok(bytes) => callback(RawMessage::new(message.type_tag(), bytes)),
                Err(e) => warn!(topic = %name, "Dropping message: {e}"),
            });
        self.inner.subscribe(topic, ANY_TYPE, handler)
    }

    /// Объявленные узлом топики.
    pub fn advertised_topics(&self) -> Vec<String> {
        self.inner
            .publications
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Число удалённых подписчиков, подключённых к публикации топика.
    pub fn remote_subscriber_count(
        &self,
        topic: &str,
    ) -> usize {
        let topic = self.decode_topic_name(topic);
        self.inner
            .publications
            .get(&topic)
            .map(|publication| publication.remote_connections().len())
            .unwrap_or(0)
    }

    /// Число исходящих соединений к издателям топика.
    pub fn publisher_link_count(
        &self,
        topic: &str,
    ) -> usize {
        let topic = self.decode_topic_name(topic);
        self.inner
            .remote_links
            .iter()
            .filter(|entry| entry.key().0 == topic && entry.value().is_open())
            .count()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.is_shut_down() && self.inner.master.is_open()
    }

    /// Останавливает узел: закрывает соединение с брокером, сервер данных и
    /// все соединения с издателями и подписчиками. Повторный вызов ничего не
    /// делает.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl NodeInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), TopicError> {
        if self.is_shut_down() {
            Err(TopicError::NodeShutdown)
        } else {
            Ok(())
        }
    }

    fn send_master(
        &self,
        message: &ControlMessage,
    ) -> Result<(), TopicError> {
        let frame = message.to_frame()?;
        self.master.enqueue_frame(&frame)?;
        Ok(())
    }

    fn register_namespace(
        &self,
        namespace: &str,
    ) -> Result<(), TopicError> {
        self.ensure_running()?;
        add_namespace(&mut self.namespaces.write(), namespace);
        self.send_master(&ControlMessage::RegisterTopicNamespace(
            namespace.to_string(),
        ))
    }

    fn advertise(
        self: &Arc<Self>,
        topic: &str,
        type_tag: &str,
        options: AdvertiseOptions,
    ) -> Result<Arc<PublisherHandle>, TopicError> {
        self.ensure_running()?;
        let topic = expand_topic(topic, &self.config.namespace);

        let (publication, is_new) = {
            let entry = self.publications.entry(topic.clone()).or_insert_with(|| {
                Arc::new(Publication::new(topic.clone(), type_tag, options))
            });
            let publication = entry.value().clone();
            (publication.clone(), publication.acquire() == 1)
        };

        if publication.type_tag() != type_tag {
            publication.release();
            return Err(TopicError::TypeMismatch {
                topic,
                expected: publication.type_tag().to_string(),
                got: type_tag.to_string(),
            });
        }

        let handle = Arc::new(PublisherHandle {
            node: Arc::downgrade(self),
            publication: publication.clone(),
        });
        if !is_new {
            return Ok(handle);
        }

        // Локальные подписчики этого топика получают значения напрямую.
        if let Some(subscription) = self.subscriptions.get(&topic).map(|entry| entry.value().clone()) {
            if subscription.accepts(type_tag) {
                let handlers = subscription.handlers.read().clone();
                for (id, handler) in handlers {
                    publication.add_transport(Arc::new(SubscriptionTransport::local(
                        topic.clone(),
                        id,
                        handler,
                    )));
                }
            }
        }

        self.send_master(&ControlMessage::Advertise(PublishAnnounce {
            topic: topic.clone(),
            type_tag: type_tag.to_string(),
            endpoint: self.endpoint.clone(),
        }))?;
        debug!(topic = %topic, type_tag, "Topic advertised");
        Ok(handle)
    }

    /// Публикация для `publish`: существующая или объявленная на лету.
    fn publication_for(
        self: &Arc<Self>,
        topic: &str,
        type_tag: &str,
    ) -> Result<Arc<Publication>, TopicError> {
        self.ensure_running()?;
        let name = expand_topic(topic, &self.config.namespace);

        let existing = self.publications.get(&name).map(|entry| entry.value().clone());
        let publication = match existing {
            Some(publication) => publication,
            None => {
                let handle = self.advertise(&name, type_tag, AdvertiseOptions::default())?;
                let publication = handle.publication.clone();
                self.auto_publishers.insert(name.clone(), handle);
                publication
            }
        };

        if publication.type_tag() != type_tag {
            return Err(TopicError::TypeMismatch {
                topic: name,
                expected: publication.type_tag().to_string(),
                got: type_tag.to_string(),
            });
        }
        Ok(publication)
    }

    fn unadvertise(
        &self,
        publication: &Arc<Publication>,
    ) {
        if publication.release() > 0 {
            return;
        }
        let topic = publication.topic().to_string();
        let removed = self
            .publications
            .remove_if(&topic, |_, current| Arc::ptr_eq(current, publication));
        if removed.is_none() {
            return;
        }

        // Подписчики этого топика больше не нужны: соединения закрываем явно.
        for id in publication.remote_connections() {
            if let Some(connection) = self.registry.get(id) {
                connection.close();
            }
        }

        if self.is_shut_down() {
            return;
        }
        let message = ControlMessage::Unadvertise(PublishAnnounce {
            topic: topic.clone(),
            type_tag: publication.type_tag().to_string(),
            endpoint: self.endpoint.clone(),
        });
        if let Err(e) = self.send_master(&message) {
            debug!(topic = %topic, "Failed to unadvertise: {e}");
        }
    }

    fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        type_tag: &str,
        handler: MessageHandler,
    ) -> Result<Subscriber, TopicError> {
        self.ensure_running()?;
        let topic = expand_topic(topic, &self.config.namespace);
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);

        let (subscription, is_new) = {
            let mut is_new = false;
            let entry = self.subscriptions.entry(topic.clone()).or_insert_with(|| {
                is_new = true;
                Arc::new(Subscription::new(type_tag))
            });
            (entry.value().clone(), is_new)
        };

        if !subscription.accepts(type_tag) {
            return Err(TopicError::TypeMismatch {
                topic,
                expected: subscription.type_tag.clone(),
                got: type_tag.to_string(),
            });
        }
        subscription
            .handlers
            .write()
            .push((handler_id, handler.clone()));

        let subscriber = Subscriber {
            node: Arc::downgrade(self),
            topic: topic.clone(),
            handler_id,
        };

        if let Some(publication) = self.publications.get(&topic).map(|entry| entry.value().clone()) {
            if subscription.accepts(publication.type_tag()) {
                publication.add_transport(Arc::new(SubscriptionTransport::local(
                    topic.clone(),
                    handler_id,
                    handler,
                )));
            }
        }

        if is_new {
            self.send_master(&ControlMessage::Subscribe(SubscribeRequest {
                topic: topic.clone(),
                type_tag: type_tag.to_string(),
                endpoint: self.endpoint.clone(),
            }))?;
            debug!(topic = %topic, type_tag, "Subscribed");
        }
        Ok(subscriber)
    }

    fn unsubscribe(
        &self,
        topic: &str,
        handler_id: u64,
    ) {
        if let Some(publication) = self.publications.get(topic).map(|entry| entry.value().clone()) {
            publication.remove_local(handler_id);
        }

        let Some(subscription) = self.subscriptions.get(topic).map(|entry| entry.value().clone()) else {
            return;
        };
        let empty = {
            let mut handlers = subscription.handlers.write();
            handlers.retain(|(id, _)| *id != handler_id);
            handlers.is_empty()
        };
        if !empty {
            return;
        }
        if self
            .subscriptions
            .remove_if(topic, |_, current| Arc::ptr_eq(current, &subscription))
            .is_none()
        {
            return;
        }

        let links: Vec<_> = self
            .remote_links
            .iter()
            .filter(|entry| entry.key().0 == topic)
            .map(|entry| entry.key().clone())
            .collect();
        for key in links {
            if let Some((_, connection)) = self.remote_links.remove(&key) {
                connection.close();
            }
        }

        if self.is_shut_down() {
            return;
        }
        let message = ControlMessage::Unsubscribe(SubscribeRequest {
            topic: topic.to_string(),
            type_tag: subscription.type_tag.clone(),
            endpoint: self.endpoint.clone(),
        });
        if let Err(e) = self.send_master(&message) {
            debug!(topic = %topic, "Failed to unsubscribe: {e}");
        }
    }

    fn handle_master_frame(
        self: &Arc<Self>,
        frame: &Frame,
    ) {
        let message = match ControlMessage::from_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(tag = frame.tag(), "Ignoring frame from master: {e}");
                return;
            }
        };

        match message {
            ControlMessage::VersionInit(version) => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        master = %version,
                        local = PROTOCOL_VERSION,
                        "Master version differs from local version"
                    );
                }
                *self.master_version.write() = Some(version);
            }
            ControlMessage::TopicNamespacesInit(list) => {
                let mut namespaces = self.namespaces.write();
                for namespace in &list {
                    add_namespace(&mut namespaces, namespace);
                }
            }
            ControlMessage::PublishersInit(list) => {
                {
                    let mut publishers = self.publishers.write();
                    for location in list {
                        add_publisher(&mut publishers, location);
                    }
                }
                self.greeted.send_replace(true);
            }
            ControlMessage::PublisherAdd(location) => {
                add_publisher(&mut self.publishers.write(), location);
            }
            ControlMessage::PublisherDel(location) => {
                self.publishers.write().retain(|known| *known != location);
            }
            ControlMessage::TopicNamespaceAdd(namespace) => {
                add_namespace(&mut self.namespaces.write(), &namespace);
            }
            ControlMessage::PublisherSubscribe(location)
            | ControlMessage::PublisherAdvertise(location) => {
                self.connect_to_publisher(location);
            }
            other => warn!(tag = other.tag(), "Unexpected message from master"),
        }
    }

    /// Открывает прямое соединение с издателем и подписывается на данные.
    fn connect_to_publisher(
        self: &Arc<Self>,
        location: PublisherLocation,
    ) {
        if location.endpoint == self.endpoint {
            debug!(topic = %location.topic, "Skipping own publisher");
            return;
        }
        let Some(subscription) = self.subscriptions.get(&location.topic).map(|entry| entry.value().clone())
        else {
            debug!(topic = %location.topic, "Publisher location for unknown subscription");
            return;
        };

        let key = (location.topic.clone(), location.endpoint.clone());
        if self
            .remote_links
            .get(&key)
            .is_some_and(|link| link.is_open())
        {
            debug!(topic = %location.topic, publisher = %location.endpoint, "Reusing publisher link");
            return;
        }

        let weak = Arc::downgrade(self);
        let spawned = self.executor.spawn(async move {
            let Some(node) = weak.upgrade() else {
                return;
            };
            let connection = match Connection::connect(
                &location.endpoint,
                &node.executor,
                node.config.connection.clone(),
            )
            .await
            {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(topic = %location.topic, publisher = %location.endpoint, "Failed to reach publisher: {e}");
                    return;
                }
            };
            node.attach_publisher_link(&subscription, key, location, connection);
        });
        if let Err(e) = spawned {
            debug!("Failed to spawn publisher connect: {e}");
        }
    }

    fn attach_publisher_link(
        self: &Arc<Self>,
        subscription: &Subscription,
        key: (String, Endpoint),
        location: PublisherLocation,
        connection: Arc<Connection>,
    ) {
        if self.is_shut_down() || !self.subscriptions.contains_key(&location.topic) {
            connection.close();
            return;
        }

        // Одно соединение на пару (топик, издатель).
        {
            let mut entry = self.remote_links.entry(key.clone()).or_insert_with(|| connection.clone());
            if entry.id() != connection.id() {
                if entry.is_open() {
                    drop(entry);
                    connection.close();
                    return;
                }
                *entry = connection.clone();
            }
        }

        let weak = Arc::downgrade(self);
        let close_key = key.clone();
        connection.on_close(Box::new(move |id| {
            if let Some(node) = weak.upgrade() {
                node.remote_links
                    .remove_if(&close_key, |_, current| current.id() == id);
            }
        }));

        let weak = Arc::downgrade(self);
        let topic = location.topic.clone();
        let started = connection.start_read_loop(Arc::new(move |_, frame| {
            if let Some(node) = weak.upgrade() {
                node.deliver_remote(&topic, &frame);
            }
        }));
        if let Err(e) = started {
            warn!(topic = %location.topic, "Failed to start publisher link: {e}");
            connection.close();
            return;
        }

        let request = ControlMessage::DataSubscribe(DataSubscribe {
            topic: location.topic.clone(),
            type_tag: subscription.type_tag.clone(),
        });
        match request.to_frame() {
            Ok(frame) => {
                if let Err(e) = connection.enqueue_frame(&frame) {
                    warn!(topic = %location.topic, "Failed to subscribe to publisher: {e}");
                    connection.close();
                    return;
                }
            }
            Err(e) => {
                warn!(topic = %location.topic, "Failed to encode data subscription: {e}");
                connection.close();
                return;
            }
        }
        info!(
            topic = %location.topic,
            publisher = %location.endpoint,
            type_tag = %location.type_tag,
            "Connected to publisher"
        );
    }

    fn deliver_remote(
        &self,
        topic: &str,
        frame: &Frame,
    ) {
        let Some(subscription) = self.subscriptions.get(topic).map(|entry| entry.value().clone()) else {
            return;
        };
        let message = IncomingMessage::Remote {
            type_tag: frame.tag(),
            bytes: frame.payload(),
        };
        subscription.dispatch(&message);
    }

    /// Входящее соединение от подписчика другого узла.
    fn accept_subscriber(
        self: &Arc<Self>,
        connection: Arc<Connection>,
    ) {
        if self.is_shut_down() {
            connection.close();
            return;
        }
        self.registry.add(connection.clone());

        let weak = Arc::downgrade(self);
        connection.on_close(Box::new(move |id| {
            if let Some(node) = weak.upgrade() {
                for publication in node.publications.iter() {
                    publication.remove_connection(id);
                }
                node.registry.remove(id);
            }
        }));

        let weak = Arc::downgrade(self);
        let started = connection.start_read_loop(Arc::new(move |connection, frame| {
            if let Some(node) = weak.upgrade() {
                node.handle_data_frame(connection, &frame);
            }
        }));
        if let Err(e) = started {
            debug!("Failed to start subscriber link: {e}");
        }
    }

    fn handle_data_frame(
        &self,
        connection: &Arc<Connection>,
        frame: &Frame,
    ) {
        let request = match ControlMessage::from_frame(frame) {
            Ok(ControlMessage::DataSubscribe(request)) => request,
            Ok(other) => {
                warn!(connection = %connection.id(), tag = other.tag(), "Unexpected frame on data link");
                return;
            }
            Err(e) => {
                warn!(connection = %connection.id(), "Ignoring frame on data link: {e}");
                return;
            }
        };

        let Some(publication) = self.publications.get(&request.topic).map(|entry| entry.value().clone()) else {
            warn!(topic = %request.topic, "Subscription for a topic this node does not publish");
            return;
        };
        if request.type_tag != ANY_TYPE && request.type_tag != publication.type_tag() {
            warn!(
                topic = %request.topic,
                expected = publication.type_tag(),
                got = %request.type_tag,
                "Subscriber type differs from publication type"
            );
        }

        let link: Arc<dyn FrameLink> = connection.clone();
        publication.add_transport(Arc::new(SubscriptionTransport::init(
            request.topic.clone(),
            &link,
            self.registry.clone(),
        )));
        debug!(topic = %request.topic, connection = %connection.id(), "Subscriber attached");
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.data_server.stop();
        self.auto_publishers.clear();
        self.publications.clear();
        self.subscriptions.clear();

        let links: Vec<_> = self
            .remote_links
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in links {
            if let Some((_, connection)) = self.remote_links.remove(&key) {
                connection.close();
            }
        }
        self.registry.close_all();
        self.master.close();
        info!(endpoint = %self.endpoint, "Node shut down");
    }
}

impl Subscription {
    fn new(type_tag: &str) -> Self {
        Self {
            type_tag: type_tag.to_string(),
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn accepts(
        &self,
        type_tag: &str,
    ) -> bool {
        self.type_tag == ANY_TYPE || type_tag == ANY_TYPE || self.type_tag == type_tag
    }

    fn dispatch(
        &self,
        message: &IncomingMessage<'_>,
    ) {
        let handlers: Vec<_> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(message);
        }
    }
}

impl<M: TypedMessage> Publisher<M> {
    pub fn topic(&self) -> &str {
        self.handle.publication.topic()
    }

    /// Публикует значение всем подписчикам топика.
    ///
    /// # Возвращает
    /// - число подписчиков, принявших сообщение
    /// - `TopicError::NodeShutdown`, если узел остановлен
    pub fn publish(
        &self,
        value: &M,
    ) -> Result<usize, TopicError> {
        match self.handle.node.upgrade() {
            Some(node) if !node.is_shut_down() => Ok(self
                .handle
                .publication
                .publish(&OutgoingMessage::typed(value))),
            _ => Err(TopicError::NodeShutdown),
        }
    }

    /// Есть ли у топика удалённые подписчики.
    pub fn has_connections(&self) -> bool {
        self.handle.publication.has_remote_subscribers()
    }
}

impl Subscriber {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

async fn connect_master(
    config: &NodeConfig,
    executor: &IoExecutor,
) -> Result<Arc<Connection>, NetworkError> {
    let attempts = config.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match Connection::connect(&config.master, executor, config.connection.clone()).await {
            Ok(connection) => return Ok(connection),
            Err(e) if attempt < attempts => {
                warn!(
                    master = %config.master,
                    attempt,
                    attempts,
                    "Master unavailable: {e}"
                );
                attempt += 1;
                tokio::time::sleep(config.retry_interval()).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn add_publisher(
    publishers: &mut Vec<PublisherLocation>,
    location: PublisherLocation,
) {
    if !publishers.contains(&location) {
        publishers.push(location);
    }
}

fn add_namespace(
    namespaces: &mut Vec<String>,
    namespace: &str,
) {
    if !namespace.is_empty() && !namespaces.iter().any(|n| n == namespace) {
        namespaces.push(namespace.to_string());
    }
}

/// Раскрывает `~` и схлопывает повторные `/`. Имя всегда начинается с `/`.
pub fn expand_topic(
    topic: &str,
    namespace: &str,
) -> String {
    let raw = match topic.strip_prefix('~') {
        Some(rest) => format!("/simbus/{namespace}/{rest}"),
        None => format!("/{topic}"),
    };

    let mut expanded = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '/' && expanded.ends_with('/') {
            continue;
        }
        expanded.push(c);
    }
    if expanded.len() > 1 && expanded.ends_with('/') {
        expanded.pop();
    }
    expanded
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            master: Endpoint::new("localhost", 11345),
            bind_host: "127.0.0.1".to_string(),
            advertised_host: None,
            namespace: "default".to_string(),
            connect_attempts: 30,
            retry_interval_ms: 1_000,
            connection: ConnectionConfig::default(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Node")
            .field("endpoint", &self.inner.endpoint)
            .field("master", &self.inner.config.master)
            .field("publications", &self.inner.publications.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

impl<M> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M> fmt::Debug for Publisher<M> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.handle.publication.topic())
            .field("type_tag", &self.handle.publication.type_tag())
            .finish()
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("handler_id", &self.handler_id)
            .finish()
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        if let Some(node) = self.node.upgrade() {
            node.unadvertise(&self.publication);
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(node) = self.node.upgrade() {
            node.unsubscribe(&self.topic, self.handler_id);
        }
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
