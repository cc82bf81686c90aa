use std::future::Future;

use vitals_api::{InboundStream, Message, OutboundPublisher, Transport, VitalsRecord};

use crate::classifier::{self, Destination, Verdict};
use crate::config::RelayConfig;
use crate::error::{ConnectStage, RelayError};

/// Lifecycle of a relay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Running,
    Terminated,
}

/// Counters for one run, logged at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub healthy: u64,
    pub unhealthy: u64,
    /// Subset of `unhealthy` that failed validation.
    pub invalid: u64,
    /// Messages that could not be decoded, published or flushed.
    pub failed: u64,
}

/// Why the running loop stopped.
#[derive(Debug)]
enum LoopExit {
    StreamClosed,
    Shutdown,
    Fatal(RelayError),
}

/// Consume → classify → produce loop over one inbound topic and two
/// outbound topics.
///
/// Strictly sequential: one message is received, classified, published and
/// flushed before the next receive.
pub struct Relay<'a> {
    config: &'a RelayConfig,
    transport: &'a dyn Transport,
    state: RelayState,
    stats: RelayStats,
}

impl std::fmt::Debug for Relay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'a> Relay<'a> {
    pub fn new(config: &'a RelayConfig, transport: &'a dyn Transport) -> Self {
        Self {
            config,
            transport,
            state: RelayState::Connecting,
            stats: RelayStats::default(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Topic name a destination resolves to.
    pub fn topic_for(&self, destination: Destination) -> &'a str {
        match destination {
            Destination::Healthy => &self.config.topics.healthy,
            Destination::Unhealthy => &self.config.topics.unhealthy,
        }
    }

    /// Connect, relay until the stream closes, a fatal error occurs or
    /// `shutdown` resolves, then release both handles.
    ///
    /// Returns `Err` when connecting fails (the loop never starts) or when the
    /// loop hit a fatal receive error. Cleanup runs on every path.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RelayStats, RelayError>
    where
        F: Future<Output = ()>,
    {
        self.state = RelayState::Connecting;
        let config = self.config;
        let broker = &config.broker.address;
        let input = &config.topics.input;
        tracing::info!(broker = %broker, topic = %input, group = %config.consumer.group_id, "connecting to broker");

        let settings = config.consumer_settings();
        let mut inbound = match self.transport.subscribe(input, &settings).await {
            Ok(s) => s,
            Err(source) => {
                return Err(self.connect_failed(ConnectStage::Subscribe, source));
            }
        };

        let mut publisher = match self.transport.publisher().await {
            Ok(p) => p,
            Err(source) => {
                close_inbound(&mut *inbound).await;
                return Err(self.connect_failed(ConnectStage::Publisher, source));
            }
        };

        tracing::info!(broker = %broker, "connected to broker");
        self.state = RelayState::Running;

        let exit = self.pump(&mut *inbound, &mut *publisher, shutdown).await;

        self.state = RelayState::Terminated;
        close_inbound(&mut *inbound).await;
        close_publisher(&mut *publisher).await;

        let s = self.stats;
        tracing::info!(
            received = s.received,
            healthy = s.healthy,
            unhealthy = s.unhealthy,
            invalid = s.invalid,
            failed = s.failed,
            reason = ?exit,
            "relay terminated"
        );

        match exit {
            LoopExit::Fatal(e) => Err(e),
            LoopExit::StreamClosed | LoopExit::Shutdown => Ok(s),
        }
    }

    fn connect_failed(&mut self, stage: ConnectStage, source: vitals_api::TransportError) -> RelayError {
        self.state = RelayState::Terminated;
        let err = RelayError::Connect { stage, source };
        tracing::error!(broker = %self.config.broker.address, error = %err, "failed to connect to broker");
        err
    }

    async fn pump<F>(
        &mut self,
        inbound: &mut dyn InboundStream,
        publisher: &mut dyn OutboundPublisher,
        shutdown: F,
    ) -> LoopExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Shutdown is only observed while parked at the pull.
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => return LoopExit::Shutdown,
                next = inbound.recv() => next,
            };

            let message = match next {
                None => {
                    tracing::info!("inbound stream closed");
                    return LoopExit::StreamClosed;
                }
                Some(Ok(message)) => message,
                Some(Err(source)) => {
                    let err = RelayError::Receive(source);
                    if err.is_fatal() {
                        tracing::error!(error = %err, "inbound stream failed");
                        return LoopExit::Fatal(err);
                    }
                    self.stats.failed += 1;
                    tracing::error!(error = %err, "receive failed, continuing");
                    continue;
                }
            };

            self.stats.received += 1;
            if let Err(err) = self.relay_message(&message, &mut *publisher).await {
                self.stats.failed += 1;
                tracing::error!(
                    error = %err,
                    topic = %message.topic,
                    offset = ?message.offset,
                    payload = %message.payload_lossy(),
                    "error processing message"
                );
                if err.is_fatal() {
                    return LoopExit::Fatal(err);
                }
            }
        }
    }

    /// Decode, classify, publish and flush a single message.
    async fn relay_message(
        &mut self,
        message: &Message,
        publisher: &mut dyn OutboundPublisher,
    ) -> Result<Destination, RelayError> {
        let record = VitalsRecord::from_payload(&message.payload).map_err(|source| {
            RelayError::Decode {
                offset: message.offset,
                source,
            }
        })?;
        tracing::info!(offset = ?message.offset, record = %record, "received vitals data");

        let verdict = classifier::verdict(&record);
        let destination = Destination::from(verdict);
        let topic = self.topic_for(destination);

        // Forward the original bytes: the outbound record is the inbound one.
        publisher
            .send(topic, message.payload.clone())
            .await
            .map_err(|source| RelayError::Publish {
                topic: topic.to_string(),
                source,
            })?;
        publisher.flush().await.map_err(|source| RelayError::Flush {
            topic: topic.to_string(),
            source,
        })?;

        match destination {
            Destination::Healthy => self.stats.healthy += 1,
            Destination::Unhealthy => self.stats.unhealthy += 1,
        }
        if verdict == Verdict::Invalid {
            self.stats.invalid += 1;
        }
        tracing::info!(topic = %topic, %destination, record = %record, "sent {destination} vitals");
        Ok(destination)
    }
}

async fn close_inbound(inbound: &mut dyn InboundStream) {
    if let Err(e) = inbound.close().await {
        tracing::debug!(error = %e, "ignoring error while closing subscription");
    }
}

async fn close_publisher(publisher: &mut dyn OutboundPublisher) {
    if let Err(e) = publisher.close().await {
        tracing::debug!(error = %e, "ignoring error while closing publisher");
    }
}
