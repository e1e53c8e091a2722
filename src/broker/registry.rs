use std::{collections::HashMap, fmt, sync::Arc};

use crate::network::{
    connection_state::ConnectionId,
    endpoint::Endpoint,
    link::FrameLink,
    protocol::{PublishAnnounce, PublisherLocation, SubscribeRequest},
};

/// Запись об издателе топика.
#[derive(Clone)]
pub struct PublisherRecord {
    pub topic: String,
    pub type_tag: String,
    pub endpoint: Endpoint,
    pub connection: ConnectionId,
    pub link: Arc<dyn FrameLink>,
}

/// Запись о подписчике топика.
#[derive(Clone)]
pub struct SubscriberRecord {
    pub topic: String,
    pub type_tag: String,
    pub endpoint: Endpoint,
    pub connection: ConnectionId,
    pub link: Arc<dyn FrameLink>,
}

/// Реестр издателей и подписчиков брокера.
///
/// Не синхронизирован: брокер держит его под одним мьютексом. Записи живут,
/// пока живо соединение, через которое они пришли.
#[derive(Default)]
pub struct TopicRegistry {
    publishers: HashMap<String, Vec<PublisherRecord>>,
    subscribers: HashMap<String, Vec<SubscriberRecord>>,
    namespaces: Vec<String>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl PublisherRecord {
    pub fn location(&self) -> PublisherLocation {
        PublisherLocation {
            topic: self.topic.clone(),
            type_tag: self.type_tag.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавляет издателя.
    ///
    /// # Возвращает
    /// - `false`, если тот же издатель (соединение, топик и адрес) уже
    ///   объявлен
    pub fn announce(
        &mut self,
        announce: PublishAnnounce,
        link: &Arc<dyn FrameLink>,
    ) -> bool {
        let connection = link.id();
        let records = self.publishers.entry(announce.topic.clone()).or_default();
        if records
            .iter()
            .any(|r| r.connection == connection && r.endpoint == announce.endpoint)
        {
            return false;
        }

        records.push(PublisherRecord {
            topic: announce.topic,
            type_tag: announce.type_tag,
            endpoint: announce.endpoint,
            connection,
            link: link.clone(),
        });
        true
    }

    /// Убирает издателя, объявленного через это соединение.
    pub fn withdraw(
        &mut self,
        announce: &PublishAnnounce,
        connection: ConnectionId,
    ) -> bool {
        remove_matching(&mut self.publishers, &announce.topic, |r| {
            r.connection == connection && r.endpoint == announce.endpoint
        }) > 0
    }

    /// Добавляет подписчика. Повторная подписка того же соединения на тот же
    /// топик ничего не меняет.
    pub fn subscribe(
        &mut self,
        request: SubscribeRequest,
        link: &Arc<dyn FrameLink>,
    ) -> bool {
        let connection = link.id();
        let records = self.subscribers.entry(request.topic.clone()).or_default();
        if records
            .iter()
            .any(|r| r.connection == connection && r.endpoint == request.endpoint)
        {
            return false;
        }

        records.push(SubscriberRecord {
            topic: request.topic,
            type_tag: request.type_tag,
            endpoint: request.endpoint,
            connection,
            link: link.clone(),
        });
        true
    }

    pub fn unsubscribe(
        &mut self,
        request: &SubscribeRequest,
        connection: ConnectionId,
    ) -> bool {
        remove_matching(&mut self.subscribers, &request.topic, |r| {
            r.connection == connection && r.endpoint == request.endpoint
        }) > 0
    }

    /// Адреса издателей топика, чьи соединения ещё открыты.
    ///
    /// Линейный просмотр: записей на топик немного, и просмотр выполняется
    /// только при подписке.
    pub fn publishers_for(
        &self,
        topic: &str,
    ) -> Vec<PublisherLocation> {
        self.publishers
            .get(topic)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.link.is_open())
                    .map(PublisherRecord::location)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Все открытые издатели брокера, упорядоченные по топику.
    pub fn all_publishers(&self) -> Vec<PublisherLocation> {
        let mut locations: Vec<_> = self
            .publishers
            .values()
            .flatten()
            .filter(|r| r.link.is_open())
            .map(PublisherRecord::location)
            .collect();
        locations.sort_by(|a, b| a.topic.cmp(&b.topic));
        locations
    }

    /// Открытые подписчики топика.
    pub fn subscribers_for(
        &self,
        topic: &str,
    ) -> Vec<SubscriberRecord> {
        self.subscribers
            .get(topic)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.link.is_open())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Удаляет все записи соединения.
    ///
    /// # Возвращает
    /// - адреса удалённых издателей и число удалённых подписчиков
    pub fn purge_connection(
        &mut self,
        connection: ConnectionId,
    ) -> (Vec<PublisherLocation>, usize) {
        let publishers = purge(&mut self.publishers, |r| r.connection == connection)
            .iter()
            .map(PublisherRecord::location)
            .collect();
        let subscribers = purge(&mut self.subscribers, |r| r.connection == connection).len();
        (publishers, subscribers)
    }

    /// Запоминает пространство имён.
    ///
    /// # Возвращает
    /// - `true`, если оно новое
    pub fn register_namespace(
        &mut self,
        namespace: &str,
    ) -> bool {
        if namespace.is_empty() || self.namespaces.iter().any(|n| n == namespace) {
            return false;
        }
        self.namespaces.push(namespace.to_string());
        true
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self
            .publishers
            .keys()
            .chain(self.subscribers.keys())
            .cloned()
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.values().map(Vec::len).sum()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.publishers.clear();
        self.subscribers.clear();
        self.namespaces.clear();
    }
}

fn remove_matching<T>(
    map: &mut HashMap<String, Vec<T>>,
    topic: &str,
    predicate: impl Fn(&T) -> bool,
) -> usize {
    let Some(records) = map.get_mut(topic) else {
        return 0;
    };
    let before = records.len();
    records.retain(|r| !predicate(r));
    let removed = before - records.len();
    if records.is_empty() {
        map.remove(topic);
    }
    removed
}

fn purge<T>(
    map: &mut HashMap<String, Vec<T>>,
    predicate: impl Fn(&T) -> bool,
) -> Vec<T> {
    let mut removed = Vec::new();
    map.retain(|_, records| {
        let (gone, kept): (Vec<T>, Vec<T>) = records.drain(..).partition(|r| predicate(r));
        *records = kept;
        removed.extend(gone);
        !records.is_empty()
    });
    removed
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl fmt::Debug for PublisherRecord {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PublisherRecord")
            .field("topic", &self.topic)
            .field("type_tag", &self.type_tag)
            .field("endpoint", &self.endpoint)
            .field("connection", &self.connection)
            .finish()
    }
}

impl fmt::Debug for SubscriberRecord {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SubscriberRecord")
            .field("topic", &self.topic)
            .field("type_tag", &self.type_tag)
            .field("endpoint", &self.endpoint)
            .field("connection", &self.connection)
            .finish()
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("publishers", &self.publisher_count())
            .field("subscribers", &self.subscriber_count())
            .field("namespaces", &self.namespaces)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::network::link::mock::MockLink;

    fn link() -> (Arc<MockLink>, Arc<dyn FrameLink>) {
        let mock = Arc::new(MockLink::new());
        let link: Arc<dyn FrameLink> = mock.clone();
        (mock, link)
    }

    fn announce(
        topic: &str,
        port: u16,
    ) -> PublishAnnounce {
        PublishAnnounce {
            topic: topic.into(),
            type_tag: "demo.Pose".into(),
            endpoint: Endpoint::new("127.0.0.1", port),
        }
    }

    fn request(topic: &str) -> SubscribeRequest {
        SubscribeRequest {
            topic: topic.into(),
            type_tag: "demo.Pose".into(),
            endpoint: Endpoint::new("127.0.0.1", 9000),
        }
    }

    /// Тест проверяет идемпотентность повторного объявления.
    #[test]
    fn test_announce_is_idempotent() {
        let mut registry = TopicRegistry::new();
        let (_mock, link) = link();

        assert!(registry.announce(announce("/a", 1000), &link));
        assert!(!registry.announce(announce("/a", 1000), &link));
        assert!(registry.announce(announce("/a", 1001), &link));
        assert_eq!(registry.publisher_count(), 2);
    }

    #[test]
    fn test_withdraw_and_unsubscribe() {
        let mut registry = TopicRegistry::new();
        let (_mock, link) = link();

        registry.announce(announce("/a", 1000), &link);
        registry.subscribe(request("/a"), &link);
        assert!(!registry.subscribe(request("/a"), &link));

        assert!(registry.withdraw(&announce("/a", 1000), link.id()));
        assert!(!registry.withdraw(&announce("/a", 1000), link.id()));
        assert!(registry.unsubscribe(&request("/a"), link.id()));
        assert!(registry.topics().is_empty());
    }

    /// Тест проверяет, что закрытие соединения удаляет все его записи, а
    /// записи других соединений остаются.
    #[test]
    fn test_purge_connection() {
        let mut registry = TopicRegistry::new();
        let (_a, link_a) = link();
        let (_b, link_b) = link();

        registry.announce(announce("/a", 1000), &link_a);
        registry.announce(announce("/b", 1000), &link_a);
        registry.subscribe(request("/b"), &link_a);
        registry.announce(announce("/a", 2000), &link_b);

        let (mut purged, subscribers) = registry.purge_connection(link_a.id());
        purged.sort_by(|a, b| a.topic.cmp(&b.topic));
        let topics: Vec<_> = purged.iter().map(|l| l.topic.as_str()).collect();
        assert_eq!(topics, vec!["/a", "/b"]);
        assert_eq!(subscribers, 1);

        let left = registry.publishers_for("/a");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].endpoint.port, 2000);
        assert!(registry.publishers_for("/b").is_empty());
        assert_eq!(registry.all_publishers(), left);
        assert_eq!(registry.purge_connection(link_a.id()), (Vec::new(), 0));
    }

    /// Тест проверяет, что закрытый издатель не попадает в ответ даже до
    /// очистки его записей.
    #[test]
    fn test_closed_publisher_is_never_returned() {
        let mut registry = TopicRegistry::new();
        let (mock, link) = link();
        registry.announce(announce("/a", 1000), &link);

        mock.close();
        assert!(registry.publishers_for("/a").is_empty());
        assert!(registry.all_publishers().is_empty());
        assert_eq!(registry.publisher_count(), 1);
    }

    #[test]
    fn test_namespaces() {
        let mut registry = TopicRegistry::new();
        assert!(registry.register_namespace("default"));
        assert!(!registry.register_namespace("default"));
        assert!(!registry.register_namespace(""));
        assert!(registry.register_namespace("arena"));
        assert_eq!(registry.namespaces(), ["default", "arena"]);
    }

    proptest! {
        /// Ответ на подписку совпадает с множеством открытых издателей
        /// топика при любом порядке объявлений и закрытий.
        #[test]
        fn prop_publishers_for_matches_open_set(
            ops in prop::collection::vec((0u8..3, 1000u16..1005, any::<bool>()), 0..40)
        ) {
            let topics = ["/a", "/b", "/c"];
            let mut registry = TopicRegistry::new();
            let mut expected: HashMap<&str, HashSet<u16>> = HashMap::new();
            let mut links = Vec::new();

            for (topic, port, close_after) in ops {
                let topic = topics[topic as usize];
                let (mock, link) = link();
                registry.announce(announce(topic, port), &link);
                if close_after {
                    mock.close();
                    registry.purge_connection(link.id());
                } else {
                    expected.entry(topic).or_default().insert(port);
                }
                links.push(mock);
            }

            for topic in topics {
                let got: Vec<u16> = registry
                    .publishers_for(topic)
                    .into_iter()
                    .map(|l| l.endpoint.port)
                    .collect();
                let want = expected.get(topic).cloned().unwrap_or_default();
                prop_assert_eq!(got.iter().copied().collect::<HashSet<_>>(), want);
            }
        }
    }
}
