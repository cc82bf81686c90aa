//! In-process broker implementing the transport traits.
//!
//! Topics are append-only logs held in memory. Readers wait on a broadcast
//! notification that fires on every append. Used by tests and by anything
//! that embeds the relay without a real broker.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::broadcast;

use vitals_api::{
    ConsumerSettings, InboundStream, Message, OffsetReset, OutboundPublisher, Transport,
    TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("memory broker lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// A named append-only log.
pub struct MemoryTopic {
    name: String,
    log: RwLock<Vec<Vec<u8>>>,
    closed: AtomicBool,
    /// Notification channel: broadcast unit signal on every append or close.
    notify_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for MemoryTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTopic").field("name", &self.name).finish()
    }
}

impl MemoryTopic {
    fn new(name: String) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            name,
            log: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            notify_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn append(&self, payload: Vec<u8>) {
        match self.log.write() {
            Ok(mut g) => g.push(payload),
            Err(poisoned) => poisoned.into_inner().push(payload),
        }
        // Notify readers (ignore if none).
        let _ = self.notify_tx.send(());
    }

    fn get(&self, offset: u64) -> Option<Vec<u8>> {
        let guard = match self.log.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        usize::try_from(offset).ok().and_then(|i| guard.get(i).cloned())
    }

    fn len(&self) -> u64 {
        match self.log.read() {
            Ok(g) => g.len() as u64,
            Err(poisoned) => poisoned.into_inner().len() as u64,
        }
    }

    fn snapshot(&self) -> Vec<Vec<u8>> {
        match self.log.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.notify_tx.send(());
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct BrokerState {
    topics: Mutex<HashMap<String, Arc<MemoryTopic>>>,
    /// (group, topic) → next offset to read.
    committed: Mutex<HashMap<(String, String), u64>>,
    reject: Mutex<Option<TransportError>>,
    failing_topics: Mutex<HashSet<String>>,
    failing_flushes: Mutex<HashSet<String>>,
    closed_subscriptions: AtomicUsize,
    closed_publishers: AtomicUsize,
}

/// Shared handle to an in-memory broker. Clones see the same topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topics", &self.topic_names())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a topic.
    pub fn create_topic(&self, name: &str) -> Arc<MemoryTopic> {
        lock(&self.state.topics)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryTopic::new(name.to_string())))
            .clone()
    }

    pub fn topic_names(&self) -> Vec<String> {
        lock(&self.state.topics).keys().cloned().collect()
    }

    /// Append a payload as an external producer would.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.create_topic(topic).append(payload.into());
    }

    /// Everything appended to `topic` so far.
    pub fn records(&self, topic: &str) -> Vec<Vec<u8>> {
        lock(&self.state.topics)
            .get(topic)
            .map(|t| t.snapshot())
            .unwrap_or_default()
    }

    /// Mark `topic` finished: readers get `None` once they have drained it.
    pub fn close_topic(&self, topic: &str) {
        self.create_topic(topic).close();
    }

    /// Make every subsequent connect attempt fail with `error`.
    pub fn reject_connections(&self, error: TransportError) {
        *lock(&self.state.reject) = Some(error);
    }

    pub fn accept_connections(&self) {
        *lock(&self.state.reject) = None;
    }

    /// Make every publish to `topic` fail with an I/O error.
    pub fn fail_publishes_to(&self, topic: &str) {
        lock(&self.state.failing_topics).insert(topic.to_string());
    }

    /// Make every flush carrying a record for `topic` fail with an I/O error.
    /// The record is dropped; records staged for other topics still land.
    pub fn fail_flushes_to(&self, topic: &str) {
        lock(&self.state.failing_flushes).insert(topic.to_string());
    }

    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<u64> {
        lock(&self.state.committed)
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    pub fn closed_subscriptions(&self) -> usize {
        self.state.closed_subscriptions.load(Ordering::SeqCst)
    }

    pub fn closed_publishers(&self) -> usize {
        self.state.closed_publishers.load(Ordering::SeqCst)
    }

    fn check_connect(&self) -> Result<(), TransportError> {
        match lock(&self.state.reject).as_ref() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn start_offset(&self, topic: &MemoryTopic, settings: &ConsumerSettings) -> u64 {
        if settings.enable_auto_commit {
            if let Some(offset) = self.committed_offset(&settings.group_id, topic.name()) {
                return offset;
            }
        }
        match settings.auto_offset_reset {
            OffsetReset::Earliest => 0,
            OffsetReset::Latest => topic.len(),
        }
    }
}

impl Transport for MemoryBroker {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        settings: &'a ConsumerSettings,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn InboundStream>, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            self.check_connect()
                .map_err(|e| e.with_context(format!("subscribe '{topic}'")))?;
            let topic = self.create_topic(topic);
            let offset = self.start_offset(&topic, settings);
            let notify_rx = topic.notify_tx.subscribe();
            tracing::debug!(topic = %topic.name(), group = %settings.group_id, offset, "memory subscription opened");
            Ok(Box::new(MemorySubscription {
                broker: self.clone(),
                topic,
                group_id: settings.group_id.clone(),
                auto_commit: settings.enable_auto_commit,
                offset,
                notify_rx,
                closed: false,
            }) as Box<dyn InboundStream>)
        })
    }

    fn publisher(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn OutboundPublisher>, TransportError>> + Send + '_>>
    {
        Box::pin(async move {
            self.check_connect()
                .map_err(|e| e.with_context("open publisher"))?;
            Ok(Box::new(MemoryPublisher {
                broker: self.clone(),
                staged: Vec::new(),
                closed: false,
            }) as Box<dyn OutboundPublisher>)
        })
    }
}

// ---------------------------------------------------------------------------
// InboundStream implementation: sequential reads by offset
// ---------------------------------------------------------------------------

pub struct MemorySubscription {
    broker: MemoryBroker,
    topic: Arc<MemoryTopic>,
    group_id: String,
    auto_commit: bool,
    offset: u64,
    notify_rx: broadcast::Receiver<()>,
    closed: bool,
}

impl InboundStream for MemorySubscription {
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Message, TransportError>>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Some(Err(TransportError::closed("subscription already closed")));
            }
            loop {
                if let Some(payload) = self.topic.get(self.offset) {
                    let message =
                        Message::new(self.topic.name(), payload).with_offset(self.offset);
                    self.offset += 1;
                    if self.auto_commit {
                        lock(&self.broker.state.committed).insert(
                            (self.group_id.clone(), self.topic.name().to_string()),
                            self.offset,
                        );
                    }
                    return Some(Ok(message));
                }
                if self.topic.is_closed() {
                    return None;
                }
                // No data yet, wait for notification. Lag only means we re-read.
                if let Err(broadcast::error::RecvError::Closed) = self.notify_rx.recv().await {
                    return None;
                }
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::logic("subscription closed twice"));
            }
            self.closed = true;
            self.broker
                .state
                .closed_subscriptions
                .fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// OutboundPublisher implementation: staged until flush
// ---------------------------------------------------------------------------

pub struct MemoryPublisher {
    broker: MemoryBroker,
    staged: Vec<(String, Vec<u8>)>,
    closed: bool,
}

impl OutboundPublisher for MemoryPublisher {
    fn send(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::closed("publisher already closed"));
            }
            if lock(&self.broker.state.failing_topics).contains(&topic) {
                return Err(TransportError::io(format!("publish to '{topic}' rejected by broker")));
            }
            self.staged.push((topic, payload));
            Ok(())
        })
    }

    fn flush(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let failing = lock(&self.broker.state.failing_flushes).clone();
            let mut rejected = None;
            for (topic, payload) in self.staged.drain(..) {
                if failing.contains(&topic) {
                    rejected.get_or_insert(topic);
                    continue;
                }
                self.broker.create_topic(&topic).append(payload);
            }
            match rejected {
                Some(topic) => Err(TransportError::io(format!("broker did not acknowledge '{topic}'"))),
                None => Ok(()),
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::logic("publisher closed twice"));
            }
            self.flush().await?;
            self.closed = true;
            self.broker
                .state
                .closed_publishers
                .fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vitals_api::ErrorKind;

    use super::*;

    fn settings(group: &str, reset: OffsetReset) -> ConsumerSettings {
        ConsumerSettings {
            group_id: group.to_string(),
            auto_offset_reset: reset,
            enable_auto_commit: true,
        }
    }

    #[tokio::test]
    async fn reads_in_order_then_ends_when_closed() {
        let broker = MemoryBroker::new();
        broker.publish("in", "a");
        broker.publish("in", "b");
        broker.close_topic("in");

        let s = settings("g", OffsetReset::Earliest);
        let mut sub = broker.subscribe("in", &s).await.unwrap();

        let first = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        assert_eq!(first.offset, Some(0));
        let second = sub.recv().await.unwrap().unwrap();
        assert_eq!(second.payload, b"b");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_waits_for_later_publish() {
        let broker = MemoryBroker::new();
        let s = settings("g", OffsetReset::Earliest);
        let mut sub = broker.subscribe("in", &s).await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish("in", "late");
        });

        let msg = sub.recv().await.unwrap().unwrap();
        assert_eq!(msg.payload, b"late");
    }

    #[tokio::test]
    async fn latest_skips_existing_and_group_offsets_resume() {
        let broker = MemoryBroker::new();
        broker.publish("in", "old");

        let latest = settings("fresh", OffsetReset::Latest);
        let mut sub = broker.subscribe("in", &latest).await.unwrap();
        broker.publish("in", "new");
        assert_eq!(sub.recv().await.unwrap().unwrap().payload, b"new");
        assert_eq!(broker.committed_offset("fresh", "in"), Some(2));

        // Same group resumes after its committed offset.
        broker.publish("in", "newer");
        let mut again = broker.subscribe("in", &latest).await.unwrap();
        assert_eq!(again.recv().await.unwrap().unwrap().payload, b"newer");
    }

    #[tokio::test]
    async fn publish_is_visible_only_after_flush() {
        let broker = MemoryBroker::new();
        let mut publisher = broker.publisher().await.unwrap();
        publisher.send("out", b"x".to_vec()).await.unwrap();
        assert!(broker.records("out").is_empty());
        publisher.flush().await.unwrap();
        assert_eq!(broker.records("out"), vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn rejected_connections_and_failing_topics() {
        let broker = MemoryBroker::new();
        broker.reject_connections(TransportError::auth("invalid credentials"));
        let s = settings("g", OffsetReset::Earliest);
        let err = broker.subscribe("in", &s).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.message.contains("subscribe 'in'"));
        assert!(broker.publisher().await.is_err());

        broker.accept_connections();
        broker.fail_publishes_to("out");
        let mut publisher = broker.publisher().await.unwrap();
        let err = publisher.send("out", b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn failing_flush_drops_only_its_topic() {
        let broker = MemoryBroker::new();
        broker.fail_flushes_to("bad");
        let mut publisher = broker.publisher().await.unwrap();

        publisher.send("bad", b"lost".to_vec()).await.unwrap();
        publisher.send("good", b"kept".to_vec()).await.unwrap();
        let err = publisher.flush().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.message.contains("'bad'"));
        assert!(broker.records("bad").is_empty());
        assert_eq!(broker.records("good"), vec![b"kept".to_vec()]);
        // Nothing left staged.
        publisher.flush().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_counted_once() {
        let broker = MemoryBroker::new();
        let s = settings("g", OffsetReset::Earliest);
        let mut sub = broker.subscribe("in", &s).await.unwrap();
        let mut publisher = broker.publisher().await.unwrap();

        publisher.send("out", b"pending".to_vec()).await.unwrap();
        publisher.close().await.unwrap();
        sub.close().await.unwrap();
        assert!(sub.close().await.is_err());

        assert_eq!(broker.closed_publishers(), 1);
        assert_eq!(broker.closed_subscriptions(), 1);
        // Close flushes what was staged.
        assert_eq!(broker.records("out"), vec![b"pending".to_vec()]);
    }
}
