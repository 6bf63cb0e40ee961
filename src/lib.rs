//! # nsq-client
//!
//! Async client for NSQ-style publish/subscribe brokers.
//!
//! Topics fan out to channels; every channel receives each message at least
//! once. A consumer subscribes to one topic/channel on any number of
//! brokers and bounds how many messages it holds unacknowledged; a producer
//! publishes to one topic on one broker.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): size-prefixed frames, commands and their
//!   response classes
//! - **Transport** ([`transport`], [`codec`]): TCP plus negotiated layers
//!   (TLS, deflate, snappy) stacked over the socket
//! - **Connection** ([`connection`]): handshake, request/response, receive
//!   loop, heartbeats and reconnect with linear backoff
//! - **Flow control** ([`distribution`]): readiness shared between a
//!   consumer's connections
//! - **Consumer / Producer** ([`consumer`], [`producer`]): the caller-facing
//!   API
//!
//! ## Example
//!
//! ```ignore
//! use nsq_client::{Consumer, Endpoint, Producer};
//!
//! #[tokio::main]
//! async fn main() -> nsq_client::Result<()> {
//!     let endpoint = Endpoint::new("127.0.0.1", 4150);
//!
//!     let producer = Producer::builder(endpoint.clone(), "events").connect().await?;
//!     producer.publish("hello").await?;
//!
//!     let consumer = Consumer::builder("events", "archive")
//!         .endpoint(endpoint)
//!         .max_in_flight(10)
//!         .connect()
//!         .await?;
//!
//!     if let Some(message) = consumer.pop().await {
//!         consumer.confirm(&message.id).await?;
//!     }
//!     consumer.close().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod control;
pub mod distribution;
pub mod error;
pub mod producer;
pub mod protocol;
pub mod transport;
pub mod writer;

pub use config::{
    CompressionMode, ConnectionConfig, ConsumerConfig, Endpoint, FeatureOptions, ProducerConfig,
    TlsOptions,
};
pub use connection::{Connection, ConnectionEvent, ConnectionId, ConnectionState, MessageHandler};
pub use consumer::{Consumer, ConsumerBuilder, Discovery, StaticDiscovery};
pub use distribution::DistributionSnapshot;
pub use error::{NsqError, Result};
pub use producer::{Producer, ProducerBuilder};
pub use protocol::{Command, Frame, Message, MessageId};
