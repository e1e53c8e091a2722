use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use simbus::{
    broker::{Broker, BrokerConfig, LateSubscriberPolicy},
    network::{
        protocol::{
            tags, ControlMessage, PublishAnnounce, PublisherLocation, SubscribeRequest,
            PROTOCOL_VERSION,
        },
        Connection, ConnectionConfig, Endpoint, Frame, FrameHandler, IoExecutor,
    },
};
use tokio::{runtime::Handle, sync::mpsc, time::timeout};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(300);

/// Клиент брокера поверх сырого соединения.
///
/// Изменения списка издателей складываются отдельно от остальных кадров.
struct Client {
    connection: Arc<Connection>,
    frames: mpsc::UnboundedReceiver<Frame>,
    catalog: mpsc::UnboundedReceiver<Frame>,
    initial_publishers: Vec<PublisherLocation>,
}

impl Client {
    /// Подключается и проверяет приветствие брокера.
    async fn connect(
        addr: SocketAddr,
        executor: &IoExecutor,
    ) -> Result<Self> {
        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let connection =
            Connection::connect(&endpoint, executor, ConnectionConfig::default()).await?;

        let (tx, frames) = mpsc::unbounded_channel();
        let (catalog_tx, catalog) = mpsc::unbounded_channel();
        let handler: FrameHandler = Arc::new(move |_, frame| {
            let _ = match frame.tag() {
                tags::PUBLISHER_ADD | tags::PUBLISHER_DEL => catalog_tx.send(frame),
                _ => tx.send(frame),
            };
        });
        connection.start_read_loop(handler)?;

        let mut client = Self {
            connection,
            frames,
            catalog,
            initial_publishers: Vec::new(),
        };
        match client.recv().await? {
            ControlMessage::VersionInit(version) => assert_eq!(version, PROTOCOL_VERSION),
            other => return Err(anyhow!("expected version_init, got {other:?}")),
        }
        match client.recv().await? {
            ControlMessage::TopicNamespacesInit(_) => {}
            other => return Err(anyhow!("expected topic_namespaces_init, got {other:?}")),
        }
        match client.recv().await? {
            ControlMessage::PublishersInit(list) => client.initial_publishers = list,
            other => return Err(anyhow!("expected publishers_init, got {other:?}")),
        }
        Ok(client)
    }

    fn send(
        &self,
        message: ControlMessage,
    ) -> Result<()> {
        self.connection.enqueue_frame(&message.to_frame()?)?;
        Ok(())
    }

    fn advertise(
        &self,
        topic: &str,
        port: u16,
    ) -> Result<()> {
        self.send(ControlMessage::Advertise(PublishAnnounce {
            topic: topic.into(),
            type_tag: "demo.Pose".into(),
            endpoint: Endpoint::new("127.0.0.1", port),
        }))
    }

    fn subscribe(
        &self,
        topic: &str,
    ) -> Result<()> {
        self.send(ControlMessage::Subscribe(SubscribeRequest {
            topic: topic.into(),
            type_tag: "demo.Pose".into(),
            endpoint: Endpoint::new("127.0.0.1", 9000),
        }))
    }

    async fn recv(&mut self) -> Result<ControlMessage> {
        let frame = timeout(RECV_TIMEOUT, self.frames.recv())
            .await
            .map_err(|_| anyhow!("timed out waiting for a frame"))?
            .ok_or_else(|| anyhow!("connection closed"))?;
        Ok(ControlMessage::from_frame(&frame)?)
    }

    /// Следующее изменение списка издателей.
    async fn recv_catalog(&mut self) -> Result<ControlMessage> {
        let frame = timeout(RECV_TIMEOUT, self.catalog.recv())
            .await
            .map_err(|_| anyhow!("timed out waiting for a publisher list change"))?
            .ok_or_else(|| anyhow!("connection closed"))?;
        Ok(ControlMessage::from_frame(&frame)?)
    }

    async fn recv_location(&mut self) -> Result<PublisherLocation> {
        match self.recv().await? {
            ControlMessage::PublisherSubscribe(location)
            | ControlMessage::PublisherAdvertise(location) => Ok(location),
            other => Err(anyhow!("expected a publisher location, got {other:?}")),
        }
    }

    /// Ничего не приходит в течение `SILENCE`.
    async fn assert_silent(&mut self) {
        assert!(
            timeout(SILENCE, self.frames.recv()).await.is_err(),
            "unexpected frame"
        );
    }
}

async fn start_broker(policy: LateSubscriberPolicy) -> Result<(Broker, SocketAddr, IoExecutor)> {
    let executor = IoExecutor::attached(Handle::current());
    let broker = Broker::new(
        BrokerConfig {
            listen: "127.0.0.1:0".into(),
            late_subscriber_policy: policy,
            ..Default::default()
        },
        &executor,
    );
    let addr = broker.start().await?;
    Ok((broker, addr, executor))
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Тест проверяет, что подписчик получает адрес объявленного издателя.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscriber_receives_announced_publisher() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::RequestTimeOnly).await?;
    let publisher = Client::connect(addr, &executor).await?;
    let mut subscriber = Client::connect(addr, &executor).await?;

    publisher.advertise("/a", 7000)?;
    assert!(wait_until(|| broker.publisher_count() == 1).await);

    subscriber.subscribe("/a")?;
    let location = subscriber.recv_location().await?;
    assert_eq!(location.topic, "/a");
    assert_eq!(location.endpoint, Endpoint::new("127.0.0.1", 7000));
    subscriber.assert_silent().await;

    broker.stop();
    Ok(())
}

/// Тест проверяет подписку на топик без издателей.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_without_publishers_is_silent() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::RequestTimeOnly).await?;
    let mut subscriber = Client::connect(addr, &executor).await?;

    subscriber.subscribe("/b")?;
    subscriber.assert_silent().await;
    assert!(subscriber.connection.is_open());
    assert_eq!(broker.subscriber_count(), 1);

    broker.stop();
    Ok(())
}

/// Тест проверяет, что отключившийся издатель больше не сообщается.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_publisher_is_forgotten() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::RequestTimeOnly).await?;
    let publisher = Client::connect(addr, &executor).await?;

    publisher.advertise("/a", 7000)?;
    assert!(wait_until(|| broker.publisher_count() == 1).await);

    publisher.connection.close();
    assert!(wait_until(|| broker.publisher_count() == 0).await);
    assert!(wait_until(|| broker.connection_count() == 0).await);

    let mut subscriber = Client::connect(addr, &executor).await?;
    subscriber.subscribe("/a")?;
    subscriber.assert_silent().await;
    assert!(broker.publishers("/a").is_empty());

    broker.stop();
    Ok(())
}

/// Тест проверяет, что при нескольких издателях возвращаются все.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_matching_publishers_are_returned() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::RequestTimeOnly).await?;
    let first = Client::connect(addr, &executor).await?;
    let second = Client::connect(addr, &executor).await?;
    let mut subscriber = Client::connect(addr, &executor).await?;

    first.advertise("/a", 7000)?;
    second.advertise("/a", 7001)?;
    second.advertise("/other", 7002)?;
    assert!(wait_until(|| broker.publisher_count() == 3).await);

    subscriber.subscribe("/a")?;
    let mut ports = vec![
        subscriber.recv_location().await?.endpoint.port,
        subscriber.recv_location().await?.endpoint.port,
    ];
    ports.sort();
    assert_eq!(ports, vec![7000, 7001]);
    subscriber.assert_silent().await;

    broker.stop();
    Ok(())
}

/// Тест проверяет уведомление подписчика, пришедшего раньше издателя.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_notify_on_announce() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::NotifyOnAnnounce).await?;
    let mut subscriber = Client::connect(addr, &executor).await?;
    let publisher = Client::connect(addr, &executor).await?;

    subscriber.subscribe("/a")?;
    assert!(wait_until(|| broker.subscriber_count() == 1).await);
    subscriber.assert_silent().await;

    publisher.advertise("/a", 7000)?;
    let location = subscriber.recv_location().await?;
    assert_eq!(location.endpoint.port, 7000);

    broker.stop();
    Ok(())
}

/// Тест проверяет, что без уведомлений поздний издатель не сообщается.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_time_only_does_not_notify() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::RequestTimeOnly).await?;
    let mut subscriber = Client::connect(addr, &executor).await?;
    let publisher = Client::connect(addr, &executor).await?;

    subscriber.subscribe("/a")?;
    assert!(wait_until(|| broker.subscriber_count() == 1).await);

    publisher.advertise("/a", 7000)?;
    assert!(wait_until(|| broker.publisher_count() == 1).await);
    subscriber.assert_silent().await;

    broker.stop();
    Ok(())
}

/// Тест проверяет, что мусор от клиента не ломает его соединение.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_garbage_does_not_close_connection() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::RequestTimeOnly).await?;
    let client = Client::connect(addr, &executor).await?;

    client
        .connection
        .enqueue_frame(&Frame::new("bogus", Bytes::from_static(b"\x01\x02")))?;
    client
        .connection
        .enqueue_frame(&Frame::new(tags::SUBSCRIBE, Bytes::new()))?;
    client.advertise("/a", 7000)?;

    assert!(wait_until(|| broker.publisher_count() == 1).await);
    assert!(client.connection.is_open());

    broker.stop();
    assert!(wait_until(|| !client.connection.is_open()).await);
    Ok(())
}

/// Тест проверяет рассылку нового пространства имён всем клиентам.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_namespace_registration_is_broadcast() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::RequestTimeOnly).await?;
    let first = Client::connect(addr, &executor).await?;
    let mut second = Client::connect(addr, &executor).await?;
    assert!(wait_until(|| broker.connection_count() == 2).await);

    first.send(ControlMessage::RegisterTopicNamespace("arena".into()))?;
    match second.recv().await? {
        ControlMessage::TopicNamespaceAdd(namespace) => assert_eq!(namespace, "arena"),
        other => return Err(anyhow!("expected topic_namespace_add, got {other:?}")),
    }

    let mut late = Client::connect(addr, &executor).await?;
    late.assert_silent().await;
    assert_eq!(broker.namespaces(), vec!["arena".to_string()]);

    broker.stop();
    Ok(())
}

/// Тест проверяет, что клиенты получают список издателей при подключении и
/// его изменения по ходу работы.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publisher_list_is_broadcast() -> Result<()> {
    let (broker, addr, executor) = start_broker(LateSubscriberPolicy::RequestTimeOnly).await?;
    let publisher = Client::connect(addr, &executor).await?;
    assert!(publisher.initial_publishers.is_empty());

    publisher.advertise("/a", 7000)?;
    assert!(wait_until(|| broker.publisher_count() == 1).await);

    let mut watcher = Client::connect(addr, &executor).await?;
    assert_eq!(watcher.initial_publishers, broker.all_publishers());
    assert_eq!(watcher.initial_publishers[0].endpoint.port, 7000);

    publisher.advertise("/b", 7001)?;
    match watcher.recv_catalog().await? {
        ControlMessage::PublisherAdd(location) => assert_eq!(location.topic, "/b"),
        other => return Err(anyhow!("expected publisher_add, got {other:?}")),
    }

    publisher.send(ControlMessage::Unadvertise(PublishAnnounce {
        topic: "/b".into(),
        type_tag: "demo.Pose".into(),
        endpoint: Endpoint::new("127.0.0.1", 7001),
    }))?;
    match watcher.recv_catalog().await? {
        ControlMessage::PublisherDel(location) => assert_eq!(location.topic, "/b"),
        other => return Err(anyhow!("expected publisher_del, got {other:?}")),
    }

    publisher.connection.close();
    match watcher.recv_catalog().await? {
        ControlMessage::PublisherDel(location) => {
            assert_eq!(location.topic, "/a");
            assert_eq!(location.endpoint.port, 7000);
        }
        other => return Err(anyhow!("expected publisher_del, got {other:?}")),
    }
    assert!(broker.all_publishers().is_empty());
    watcher.assert_silent().await;

    broker.stop();
    Ok(())
}
