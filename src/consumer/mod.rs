//! Consumer: subscribes to a topic/channel on one or more brokers.
//!
//! The consumer owns three pieces:
//!
//! - a [`FlowController`] that shares `max_in_flight` between connections
//!   and receives every delivered message,
//! - a [`DeliveryQueue`] the caller pulls messages from,
//! - a supervisor task that reacts to connection events and polls
//!   [`Discovery`] for new brokers.
//!
//! # Example
//!
//! ```ignore
//! use nsq_client::{Consumer, Endpoint};
//!
//! let consumer = Consumer::builder("events", "archive")
//!     .endpoint(Endpoint::new("127.0.0.1", 4150))
//!     .max_in_flight(10)
//!     .connect()
//!     .await?;
//!
//! while let Some(message) = consumer.pop().await {
//!     process(&message.body);
//!     consumer.confirm(&message.id).await?;
//! }
//! ```

mod discovery;
mod queue;

use std::collections::HashSet;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, warn, Instrument, Span};

pub use discovery::{BoxFuture, Discovery, StaticDiscovery};
pub use queue::{Delivery, DeliveryQueue};

use crate::config::{ConsumerConfig, Endpoint, FeatureOptions};
use crate::connection::{Connection, ConnectionEvent, ConnectionId};
use crate::distribution::{DistributionSnapshot, FlowConfig, FlowController, Outcome};
use crate::error::{NsqError, Result};
use crate::protocol::{validate_name, Command, Message, MessageId};

enum Source {
    Direct(Endpoint),
    Discovery(Arc<dyn Discovery>),
}

/// Subscriber on one topic/channel.
pub struct Consumer {
    topic: String,
    channel: String,
    flow: FlowController,
    queue: Arc<DeliveryQueue>,
    flow_task: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    span: Span,
}

impl Consumer {
    /// Start building a consumer for `topic`/`channel`.
    pub fn builder(topic: impl Into<String>, channel: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder::new(topic, channel)
    }

    /// Topic consumed.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Channel consumed.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message.
    ///
    /// Messages held locally past the broker's message timeout are dropped
    /// here, since the broker has already handed them out again. Returns
    /// `None` after [`close`](Self::close).
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let delivery = self.queue.pop().await?;
            if let Some(message) = self.accept(delivery).await {
                return Some(message);
            }
        }
    }

    /// Take the next message if one is queued.
    pub async fn try_pop(&self) -> Option<Message> {
        while let Some(delivery) = self.queue.try_pop() {
            if let Some(message) = self.accept(delivery).await {
                return Some(message);
            }
        }
        None
    }

    async fn accept(&self, delivery: Delivery) -> Option<Message> {
        if !delivery.is_expired(Instant::now()) {
            return Some(delivery.message);
        }
        let id = delivery.message.id;
        warn!(parent: &self.span, connection = %delivery.connection, %id, "message expired in queue, dropping");
        if let Err(err) = self.flow.settle(&id, Outcome::Discard).await {
            debug!(parent: &self.span, %id, error = %err, "expired message was already settled");
        }
        None
    }

    /// Queued messages not yet popped.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Confirm a message as processed (`FIN`).
    pub async fn confirm(&self, id: &MessageId) -> Result<()> {
        self.settle(id, Command::Fin(*id), Outcome::Success).await
    }

    /// Hand a message back to the broker for redelivery after `delay`
    /// (`REQ`). Counts as a failure for backoff.
    pub async fn requeue(&self, id: &MessageId, delay: Duration) -> Result<()> {
        let command = Command::Req {
            id: *id,
            timeout_ms: delay.as_millis() as u64,
        };
        self.settle(id, command, Outcome::Failure).await
    }

    /// Reset the broker-side timeout of a message (`TOUCH`).
    pub async fn touch(&self, id: &MessageId) -> Result<()> {
        let connection = self.flow.lookup(id).await?;
        connection.transmit(Command::Touch(*id)).await?;
        Ok(())
    }

    async fn settle(&self, id: &MessageId, command: Command, outcome: Outcome) -> Result<()> {
        let connection = self.flow.lookup(id).await?;
        let name = command.name();
        if let Err(err) = connection.transmit(command).await {
            // The broker will time the message out; stop counting it here.
            let _ = self.flow.settle(id, Outcome::Discard).await;
            warn!(parent: &self.span, %id, command = name, error = %err, "settle command failed");
            return Err(err);
        }
        self.flow.settle(id, outcome).await?;
        Ok(())
    }

    /// Snapshot of readiness and in-flight bookkeeping.
    pub async fn distribution(&self) -> Result<DistributionSnapshot> {
        self.flow.snapshot().await
    }

    /// Connections currently in use.
    pub async fn connections(&self) -> Result<Vec<ConnectionId>> {
        let connections = self.flow.connections().await?;
        Ok(connections.iter().map(|c| c.id().clone()).collect())
    }

    /// Stop receiving: `RDY 0` and `CLS` on every connection, then close the
    /// queue. Messages still queued can be popped but not confirmed.
    pub async fn close(&self) {
        self.supervisor.abort();
        let connections = self.flow.shutdown().await;
        for connection in &connections {
            if let Err(err) = connection.transmit(Command::Rdy(0)).await {
                debug!(parent: &self.span, connection = %connection.id(), error = %err, "RDY 0 failed during close");
            }
            connection.close().await;
        }
        self.queue.close();
        info!(parent: &self.span, connections = connections.len(), "consumer closed");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.flow_task.abort();
        self.queue.close();
    }
}

/// Builder for [`Consumer`].
pub struct ConsumerBuilder {
    topic: String,
    channel: String,
    source: Option<Source>,
    config: ConsumerConfig,
}

impl ConsumerBuilder {
    /// Create a builder with default settings.
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            source: None,
            config: ConsumerConfig::default(),
        }
    }

    /// Connect to a single broker, reconnecting to it when lost.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.source = Some(Source::Direct(endpoint));
        self
    }

    /// Find brokers through `discovery`.
    pub fn discovery(mut self, discovery: impl Discovery) -> Self {
        self.source = Some(Source::Discovery(Arc::new(discovery)));
        self
    }

    /// Find brokers through a shared `discovery`.
    pub fn shared_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.source = Some(Source::Discovery(discovery));
        self
    }

    /// Replace the whole consumer configuration.
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Unacknowledged messages allowed across all connections.
    ///
    /// Default: 1
    pub fn max_in_flight(mut self, max_in_flight: u64) -> Self {
        self.config.max_in_flight = max_in_flight;
        self
    }

    /// Backoff step after failed messages; `None` disables backoff.
    ///
    /// Default: 1 second
    pub fn backoff_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.backoff_interval = interval;
        self
    }

    /// Transport features requested on every connection.
    pub fn features(mut self, features: FeatureOptions) -> Self {
        self.config.connection.features = features;
        self
    }

    /// Rotation period while readiness is scarce.
    ///
    /// Default: 5 seconds
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.config.watchdog_interval = interval;
        self
    }

    /// Discovery polling period.
    ///
    /// Default: 60 seconds
    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.config.discovery_interval = interval;
        self
    }

    /// Validate settings, connect and start consuming.
    ///
    /// A direct endpoint must be reachable. With discovery, brokers that
    /// cannot be reached are retried on the next poll.
    pub async fn connect(self) -> Result<Consumer> {
        validate_name("topic", &self.topic)?;
        validate_name("channel", &self.channel)?;
        self.config.validate()?;
        let source = self.source.ok_or_else(|| {
            NsqError::Configuration("consumer needs an endpoint or a discovery source".to_string())
        })?;

        let span = info_span!("nsq_flow", topic = %self.topic, channel = %self.channel);
        let queue = Arc::new(DeliveryQueue::new());
        let (flow, flow_task) = FlowController::spawn(
            FlowConfig {
                max_in_flight: self.config.max_in_flight,
                backoff_interval: self.config.backoff_interval,
                watchdog_interval: self.config.watchdog_interval,
            },
            queue.clone(),
            span.clone(),
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
            source,
            config: self.config,
            flow: flow.clone(),
            events_tx,
            connected: HashSet::new(),
            next_attempt: None,
        };

        let started = supervisor.start().instrument(span.clone()).await;
        if let Err(err) = started {
            flow.shutdown().await;
            return Err(err);
        }
        info!(parent: &span, "consumer started");

        let supervisor = tokio::spawn(supervisor.run(events).instrument(span.clone()));
        Ok(Consumer {
            topic: self.topic,
            channel: self.channel,
            flow,
            queue,
            flow_task,
            supervisor,
            span,
        })
    }
}

/// Keeps the consumer's connection set alive.
struct Supervisor {
    topic: String,
    channel: String,
    source: Source,
    config: ConsumerConfig,
    flow: FlowController,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connected: HashSet<Endpoint>,
    /// Next discovery poll or direct reconnect.
    next_attempt: Option<Instant>,
}

impl Supervisor {
    async fn start(&mut self) -> Result<()> {
        match &self.source {
            Source::Direct(endpoint) => {
                let endpoint = endpoint.clone();
                self.open(endpoint).await
            }
            Source::Discovery(_) => {
                self.discover().await;
                Ok(())
            }
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = wait_until(self.next_attempt) => {
                    self.next_attempt = None;
                    match &self.source {
                        Source::Direct(endpoint) => {
                            let endpoint = endpoint.clone();
                            if let Err(err) = self.open(endpoint).await {
                                warn!(error = %err, "direct reconnect failed");
                                self.next_attempt =
                                    Some(Instant::now() + self.config.connection.reconnect_interval);
                            }
                        }
                        Source::Discovery(_) => self.discover().await,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Reconnected(id) => {
                info!(connection = %id, "connection reconnected, resetting flow state");
                if let Err(err) = self.flow.reset_connection(&id).await {
                    warn!(connection = %id, error = %err, "flow reset failed");
                }
            }
            ConnectionEvent::Terminated { id, reason } => {
                warn!(connection = %id, %reason, "connection lost");
                self.connected.remove(id.endpoint());
                match self.flow.remove_connection(&id).await {
                    Ok(purged) if !purged.is_empty() => {
                        debug!(connection = %id, purged = purged.len(), "in-flight messages dropped")
                    }
                    Ok(_) => {}
                    Err(err) => debug!(connection = %id, error = %err, "connection was not registered"),
                }
                match &self.source {
                    Source::Direct(_) => {
                        self.next_attempt =
                            Some(Instant::now() + self.config.connection.reconnect_interval);
                    }
                    Source::Discovery(_) if self.config.rediscover_on_failure => {
                        self.next_attempt = Some(Instant::now());
                    }
                    Source::Discovery(_) => {}
                }
            }
        }
    }

    /// Look up brokers, connect to the new ones and schedule the next poll.
    async fn discover(&mut self) {
        let Source::Discovery(discovery) = &self.source else {
            return;
        };
        let discovery = discovery.clone();
        match discovery.lookup(&self.topic).await {
            Ok(endpoints) => {
                debug!(found = endpoints.len(), "discovery finished");
                for endpoint in endpoints {
                    if self.connected.contains(&endpoint) {
                        continue;
                    }
                    if let Err(err) = self.open(endpoint.clone()).await {
                        warn!(%endpoint, error = %err, "failed to connect to discovered broker");
                    }
                }
            }
            Err(err) => warn!(error = %err, "discovery failed"),
        }

        let jitter = self.config.discovery_jitter * rand::rng().random::<f64>();
        let delay = self.config.discovery_interval.mul_f64(1.0 + jitter);
        self.next_attempt = Some(Instant::now() + delay);
    }

    async fn open(&mut self, endpoint: Endpoint) -> Result<()> {
        let connection = Connection::builder(endpoint.clone())
            .config(self.config.connection.clone())
            .subscribe(self.topic.clone(), self.channel.clone())
            .handler(self.flow.clone())
            .events(self.events_tx.clone())
            .connect()
            .await?;
        self.flow.add_connection(connection).await?;
        self.connected.insert(endpoint.clone());
        info!(%endpoint, "subscribed");
        Ok(())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_requires_a_source() {
        let err = Consumer::builder("events", "archive").connect().await.err().unwrap();
        assert!(matches!(err, NsqError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_builder_validates_names_and_budget() {
        let err = Consumer::builder("events", "bad channel")
            .endpoint(Endpoint::new("127.0.0.1", 1))
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NsqError::Configuration(_)));

        let err = Consumer::builder("events", "archive")
            .endpoint(Endpoint::new("127.0.0.1", 1))
            .max_in_flight(0)
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NsqError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_discovery_with_no_brokers_starts_empty() {
        let consumer = Consumer::builder("events", "archive")
            .discovery(StaticDiscovery::new(Vec::new()))
            .connect()
            .await
            .unwrap();
        assert!(consumer.connections().await.unwrap().is_empty());
        assert_eq!(consumer.distribution().await.unwrap().ideal, 0);
        assert!(consumer.try_pop().await.is_none());

        consumer.close().await;
        assert!(consumer.pop().await.is_none());
    }
}
