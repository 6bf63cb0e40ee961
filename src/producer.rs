//! Producer: publishes to one topic on one broker.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Span};

use crate::config::{Endpoint, FeatureOptions, ProducerConfig};
use crate::connection::{Connection, ConnectionState};
use crate::error::{NsqError, Result};
use crate::protocol::{validate_name, Command, Frame};

/// Publisher bound to a broker and a topic.
///
/// One payload is sent with `PUB`, several with a single `MPUB`. Each write
/// waits for the broker's `OK`.
pub struct Producer {
    endpoint: Endpoint,
    topic: String,
    config: ProducerConfig,
    connection: Mutex<Option<Connection>>,
    span: Span,
}

impl Producer {
    /// Start building a producer for `topic` on `endpoint`.
    pub fn builder(endpoint: Endpoint, topic: impl Into<String>) -> ProducerBuilder {
        ProducerBuilder::new(endpoint, topic)
    }

    /// Topic published to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Broker published to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Publish one payload.
    pub async fn publish(&self, body: impl Into<Bytes>) -> Result<Frame> {
        self.write(vec![body.into()]).await
    }

    /// Publish `bodies` and return the broker's response.
    ///
    /// Fails with [`NsqError::Configuration`] when `bodies` is empty. If the
    /// connection was torn down a new one is opened once before giving up
    /// with [`NsqError::ConnectionUnavailable`].
    pub async fn write(&self, mut bodies: Vec<Bytes>) -> Result<Frame> {
        let command = match bodies.len() {
            0 => {
                return Err(NsqError::Configuration(
                    "write needs at least one payload".to_string(),
                ))
            }
            1 => Command::Pub {
                topic: self.topic.clone(),
                body: bodies.remove(0),
            },
            count => {
                debug!(parent: &self.span, count, "publishing batch");
                Command::Mpub {
                    topic: self.topic.clone(),
                    bodies,
                }
            }
        };

        let name = command.name();
        let connection = self.connection().await?;
        connection
            .transmit(command)
            .await?
            .ok_or(NsqError::NoResponse(name))
    }

    /// Current connection, reopened once if it terminated.
    async fn connection(&self) -> Result<Connection> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.state() != ConnectionState::Terminated {
                return Ok(connection.clone());
            }
            warn!(parent: &self.span, "producer connection terminated, opening a new one");
        }

        match self.open().await {
            Ok(connection) => {
                *slot = Some(connection.clone());
                Ok(connection)
            }
            Err(err) => {
                *slot = None;
                Err(NsqError::ConnectionUnavailable(format!(
                    "cannot reach {}: {}",
                    self.endpoint, err
                )))
            }
        }
    }

    async fn open(&self) -> Result<Connection> {
        Connection::builder(self.endpoint.clone())
            .config(self.config.connection.clone())
            .topic(self.topic.clone())
            .connect()
            .await
    }

    /// Send `CLS` and drop the connection.
    pub async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await;
            info!(parent: &self.span, "producer closed");
        }
    }
}

/// Builder for [`Producer`].
pub struct ProducerBuilder {
    endpoint: Endpoint,
    topic: String,
    config: ProducerConfig,
}

impl ProducerBuilder {
    /// Create a builder with default settings.
    pub fn new(endpoint: Endpoint, topic: impl Into<String>) -> Self {
        Self {
            endpoint,
            topic: topic.into(),
            config: ProducerConfig::default(),
        }
    }

    /// Replace the whole producer configuration.
    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport features to request.
    pub fn features(mut self, features: FeatureOptions) -> Self {
        self.config.connection.features = features;
        self
    }

    /// Reconnect attempts before the connection gives up.
    ///
    /// Default: 10
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.connection.max_reconnect_attempts = attempts;
        self
    }

    /// Pause step between reconnect attempts.
    ///
    /// Default: 5 seconds
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.connection.reconnect_interval = interval;
        self
    }

    /// Validate settings and connect.
    pub async fn connect(self) -> Result<Producer> {
        validate_name("topic", &self.topic)?;
        let span = info_span!("nsq_producer", endpoint = %self.endpoint, topic = %self.topic);
        let producer = Producer {
            endpoint: self.endpoint,
            topic: self.topic,
            config: self.config,
            connection: Mutex::new(None),
            span,
        };
        let connection = producer.open().await?;
        *producer.connection.lock().await = Some(connection);
        Ok(producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_topic_rejected() {
        let err = Producer::builder(Endpoint::new("127.0.0.1", 1), "no spaces")
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NsqError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_write_rejected() {
        let producer = Producer {
            endpoint: Endpoint::new("127.0.0.1", 1),
            topic: "events".to_string(),
            config: ProducerConfig::default(),
            connection: Mutex::new(None),
            span: Span::none(),
        };
        let err = producer.write(Vec::new()).await.unwrap_err();
        assert!(matches!(err, NsqError::Configuration(_)));
    }
}
