//! Configuration for connections, consumers and producers.
//!
//! Every struct has a `Default` impl carrying the client defaults; the
//! builders on [`crate::Connection`], [`crate::Consumer`] and
//! [`crate::Producer`] adjust individual fields.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::control::IdentifyConfig;
use crate::error::{NsqError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::writer::WriterConfig;

/// Address of a broker's TCP interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = NsqError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NsqError::Configuration(format!("endpoint {:?} has no port", s)))?;
        let port = port
            .parse()
            .map_err(|_| NsqError::Configuration(format!("endpoint {:?} has an invalid port", s)))?;
        if host.is_empty() {
            return Err(NsqError::Configuration(format!("endpoint {:?} has no host", s)));
        }
        Ok(Self::new(host, port))
    }
}

/// Compression requested during negotiation. The two modes are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    /// Raw deflate at the given level (1..=9).
    Deflate { level: u32 },
    /// Snappy framing.
    Snappy,
}

/// TLS settings for the encrypting transport layer.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Extra PEM CA bundle trusted alongside the webpki roots.
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain.
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
    /// Name checked against the server certificate; defaults to the host.
    pub server_name: Option<String>,
}

/// Optional transport features to request during IDENTIFY.
#[derive(Debug, Clone, Default)]
pub struct FeatureOptions {
    /// Request TLS.
    pub tls: Option<TlsOptions>,
    /// Request compression.
    pub compression: Option<CompressionMode>,
    /// Fail the connection when a requested feature is not granted.
    pub enforce: bool,
}

impl FeatureOptions {
    /// Check option combinations.
    pub fn validate(&self) -> Result<()> {
        if let Some(CompressionMode::Deflate { level }) = self.compression {
            if !(1..=9).contains(&level) {
                return Err(NsqError::Configuration(format!(
                    "deflate level {} outside 1..=9",
                    level
                )));
            }
        }
        if let Some(tls) = &self.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(NsqError::Configuration(
                    "TLS client certificate and key must be given together".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for commands that always get a response.
pub const DEFAULT_RESPONSE_WAIT: Duration = Duration::from_secs(1);

/// Default poll interval while waiting for a response.
pub const DEFAULT_RESPONSE_INTERVAL: Duration = Duration::from_millis(30);

/// Default reconnect attempts before a connection is declared failed.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Deadline for commands whose response is required.
    pub response_wait: Duration,
    /// Deadline for commands answered only on error; zero sends them
    /// fire-and-forget.
    pub error_wait: Duration,
    /// Poll interval inside a response wait.
    pub response_interval: Duration,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Pause step between reconnect attempts, growing linearly.
    pub reconnect_interval: Duration,
    /// Largest frame accepted from the server.
    pub max_frame_size: u32,
    /// Queued non-message frames awaiting a response waiter.
    pub response_capacity: usize,
    /// IDENTIFY defaults and overrides.
    pub identify: IdentifyConfig,
    /// Requested transport features.
    pub features: FeatureOptions,
    /// Secret sent with AUTH when the server requires it.
    pub auth_secret: Option<String>,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_wait: DEFAULT_RESPONSE_WAIT,
            error_wait: Duration::ZERO,
            response_interval: DEFAULT_RESPONSE_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_interval: Duration::from_secs(1),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            response_capacity: 64,
            identify: IdentifyConfig::default(),
            features: FeatureOptions::default(),
            auth_secret: None,
            writer: WriterConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Check settings that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.response_interval.is_zero() {
            return Err(NsqError::Configuration(
                "response_interval must be non-zero".to_string(),
            ));
        }
        if self.response_capacity == 0 {
            return Err(NsqError::Configuration(
                "response_capacity must be at least 1".to_string(),
            ));
        }
        self.features.validate()
    }
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound on unacknowledged messages across all connections.
    pub max_in_flight: u64,
    /// Backoff step after failed messages; `None` disables backoff.
    pub backoff_interval: Option<Duration>,
    /// Rotation period while readiness is scarce.
    pub watchdog_interval: Duration,
    /// Discovery polling period.
    pub discovery_interval: Duration,
    /// Random extra delay as a fraction of `discovery_interval`.
    pub discovery_jitter: f64,
    /// Re-run discovery immediately when a connection is lost.
    pub rediscover_on_failure: bool,
    /// Settings for every connection the consumer opens.
    pub connection: ConnectionConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            backoff_interval: Some(Duration::from_secs(1)),
            watchdog_interval: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(60),
            discovery_jitter: 0.3,
            rediscover_on_failure: true,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ConsumerConfig {
    /// Check consumer-level settings and the connection settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(NsqError::Configuration(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.discovery_jitter) {
            return Err(NsqError::Configuration(format!(
                "discovery_jitter {} outside 0.0..=1.0",
                self.discovery_jitter
            )));
        }
        if self.watchdog_interval.is_zero() {
            return Err(NsqError::Configuration(
                "watchdog_interval must be non-zero".to_string(),
            ));
        }
        self.connection.validate()
    }
}

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Settings for the producer's connection.
    pub connection: ConnectionConfig,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                reconnect_interval: Duration::from_secs(5),
                ..ConnectionConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_and_display() {
        let endpoint: Endpoint = "nsqd-1.internal:4150".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("nsqd-1.internal", 4150));
        assert_eq!(endpoint.to_string(), "nsqd-1.internal:4150");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!(":4150".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.response_wait, Duration::from_secs(1));
        assert!(config.error_wait.is_zero());
        assert_eq!(config.max_reconnect_attempts, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_feature_validation() {
        let features = FeatureOptions {
            compression: Some(CompressionMode::Deflate { level: 12 }),
            ..Default::default()
        };
        assert!(matches!(features.validate(), Err(NsqError::Configuration(_))));

        let features = FeatureOptions {
            tls: Some(TlsOptions {
                cert_file: Some("client.pem".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(features.validate(), Err(NsqError::Configuration(_))));
    }

    #[test]
    fn test_consumer_validation() {
        let config = ConsumerConfig {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ConsumerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_producer_defaults() {
        let config = ProducerConfig::default();
        assert_eq!(config.connection.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.connection.max_reconnect_attempts, 10);
    }
}
