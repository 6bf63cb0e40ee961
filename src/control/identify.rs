//! IDENTIFY payload builder and negotiation response parsing.
//!
//! # Example
//!
//! ```
//! use nsq_client::config::{CompressionMode, FeatureOptions};
//! use nsq_client::control::{build_identify_body, IdentifyConfig};
//!
//! let features = FeatureOptions {
//!     compression: Some(CompressionMode::Snappy),
//!     ..Default::default()
//! };
//! let body = build_identify_body(&IdentifyConfig::default(), &features).unwrap();
//! let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
//! assert_eq!(json["snappy"], true);
//! assert_eq!(json["feature_negotiation"], true);
//! ```

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{CompressionMode, FeatureOptions};
use crate::error::{NsqError, Result};
use crate::protocol::Frame;

/// Client description sent with IDENTIFY.
///
/// Unset optional fields are left out of the payload so the server applies
/// its own defaults. `overrides` is merged last and wins over every other
/// key, including the feature flags.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyConfig {
    /// Short client identifier.
    pub client_id: String,
    /// Host name reported to the server.
    pub hostname: String,
    /// Library identification.
    pub user_agent: String,
    /// Ask the server to answer with its settings as JSON.
    pub feature_negotiation: bool,
    /// Heartbeat interval in milliseconds (`-1` disables heartbeats).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<i64>,
    /// Server-side output buffer size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<i64>,
    /// Server-side output buffer flush timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_timeout: Option<i64>,
    /// Per-client message timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_timeout: Option<u64>,
    /// Percentage of messages to receive (1..=99).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u8>,
    /// Raw keys merged over the generated payload.
    #[serde(skip)]
    pub overrides: Map<String, Value>,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let client_id = hostname.split('.').next().unwrap_or("localhost").to_string();
        Self {
            client_id,
            hostname,
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            feature_negotiation: true,
            heartbeat_interval: None,
            output_buffer_size: None,
            output_buffer_timeout: None,
            msg_timeout: None,
            sample_rate: None,
            overrides: Map::new(),
        }
    }
}

/// Build the IDENTIFY JSON body from client defaults, requested features
/// and caller overrides. Null values are dropped.
pub fn build_identify_body(config: &IdentifyConfig, features: &FeatureOptions) -> Result<Bytes> {
    let mut body = match serde_json::to_value(config)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    body.insert("tls_v1".to_string(), json!(features.tls.is_some()));
    match features.compression {
        Some(CompressionMode::Deflate { level }) => {
            body.insert("deflate".to_string(), json!(true));
            body.insert("deflate_level".to_string(), json!(level));
        }
        Some(CompressionMode::Snappy) => {
            body.insert("snappy".to_string(), json!(true));
        }
        None => {}
    }

    for (key, value) in &config.overrides {
        body.insert(key.clone(), value.clone());
    }
    body.retain(|_, value| !value.is_null());

    Ok(Bytes::from(serde_json::to_vec(&Value::Object(body))?))
}

/// Settings the server granted during negotiation.
///
/// A plain `OK` answer (negotiation off) yields the defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Largest RDY count the server accepts.
    pub max_rdy_count: Option<u64>,
    /// Server version.
    pub version: Option<String>,
    /// Largest timeout allowed for TOUCH/REQ, milliseconds.
    pub max_msg_timeout: Option<u64>,
    /// Time before an unacknowledged message is redelivered, milliseconds.
    pub msg_timeout: Option<u64>,
    /// TLS granted.
    pub tls_v1: bool,
    /// Deflate granted.
    pub deflate: bool,
    /// Deflate level in effect.
    pub deflate_level: Option<u32>,
    /// Largest deflate level the server allows.
    pub max_deflate_level: Option<u32>,
    /// Snappy granted.
    pub snappy: bool,
    /// Sample rate in effect.
    pub sample_rate: Option<u32>,
    /// The server requires AUTH before other commands.
    pub auth_required: bool,
    /// Output buffer size in effect.
    pub output_buffer_size: Option<i64>,
    /// Output buffer timeout in effect.
    pub output_buffer_timeout: Option<i64>,
    /// Keys this client does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EndpointSettings {
    /// Parse the IDENTIFY response frame.
    pub fn from_response(frame: &Frame) -> Result<Self> {
        match frame {
            Frame::Response(data) if data.as_ref() == b"OK" => Ok(Self::default()),
            Frame::Response(data) => Ok(serde_json::from_slice(data)?),
            Frame::Error(data) => Err(NsqError::BadResponse {
                command: "IDENTIFY",
                error: String::from_utf8_lossy(data).into_owned(),
            }),
            Frame::Message(_) => Err(NsqError::MalformedFrame(
                "message frame received in reply to IDENTIFY".to_string(),
            )),
        }
    }

    /// Redelivery timeout, if the server reported one.
    pub fn msg_timeout(&self) -> Option<Duration> {
        self.msg_timeout.map(Duration::from_millis)
    }
}

/// JSON answer to AUTH.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthReply {
    /// Identity the secret maps to.
    pub identity: Option<String>,
    /// URL describing the identity.
    pub identity_url: Option<String>,
    /// Number of permissions granted.
    pub permission_count: Option<u64>,
}

impl AuthReply {
    /// Parse the AUTH response body; a bare `OK` yields an empty reply.
    pub fn from_response(data: &[u8]) -> Result<Self> {
        if data == b"OK" {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsOptions;

    fn body_json(config: &IdentifyConfig, features: &FeatureOptions) -> Value {
        let body = build_identify_body(config, features).unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_defaults_omit_unset_fields() {
        let json = body_json(&IdentifyConfig::default(), &FeatureOptions::default());
        assert_eq!(json["feature_negotiation"], true);
        assert_eq!(json["tls_v1"], false);
        assert!(json.get("heartbeat_interval").is_none());
        assert!(json.get("snappy").is_none());
        assert!(json["user_agent"].as_str().unwrap().starts_with("nsq-client/"));
    }

    #[test]
    fn test_feature_flags() {
        let features = FeatureOptions {
            tls: Some(TlsOptions::default()),
            compression: Some(CompressionMode::Deflate { level: 3 }),
            enforce: true,
        };
        let json = body_json(&IdentifyConfig::default(), &features);
        assert_eq!(json["tls_v1"], true);
        assert_eq!(json["deflate"], true);
        assert_eq!(json["deflate_level"], 3);
    }

    #[test]
    fn test_overrides_win_and_nulls_dropped() {
        let mut config = IdentifyConfig {
            heartbeat_interval: Some(30_000),
            ..Default::default()
        };
        config.overrides.insert("heartbeat_interval".into(), json!(5_000));
        config.overrides.insert("client_id".into(), Value::Null);
        config.overrides.insert("custom".into(), json!("value"));

        let json = body_json(&config, &FeatureOptions::default());
        assert_eq!(json["heartbeat_interval"], 5_000);
        assert!(json.get("client_id").is_none());
        assert_eq!(json["custom"], "value");
    }

    #[test]
    fn test_settings_from_ok() {
        let frame = Frame::Response(Bytes::from_static(b"OK"));
        assert_eq!(EndpointSettings::from_response(&frame).unwrap(), EndpointSettings::default());
    }

    #[test]
    fn test_settings_from_json() {
        let frame = Frame::Response(Bytes::from_static(
            br#"{"max_rdy_count":2500,"version":"1.3.0","msg_timeout":60000,"tls_v1":false,"snappy":true,"auth_required":false,"max_deflate_level":6,"extra_key":1}"#,
        ));
        let settings = EndpointSettings::from_response(&frame).unwrap();
        assert_eq!(settings.max_rdy_count, Some(2500));
        assert_eq!(settings.version.as_deref(), Some("1.3.0"));
        assert!(settings.snappy);
        assert!(!settings.deflate);
        assert_eq!(settings.msg_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(settings.extra["extra_key"], 1);
    }

    #[test]
    fn test_settings_from_error() {
        let frame = Frame::Error(Bytes::from_static(b"E_BAD_BODY invalid"));
        assert!(matches!(
            EndpointSettings::from_response(&frame),
            Err(NsqError::BadResponse { command: "IDENTIFY", .. })
        ));
    }

    #[test]
    fn test_auth_reply() {
        let reply =
            AuthReply::from_response(br#"{"identity":"worker","permission_count":2}"#).unwrap();
        assert_eq!(reply.identity.as_deref(), Some("worker"));
        assert_eq!(reply.permission_count, Some(2));
        assert_eq!(AuthReply::from_response(b"OK").unwrap(), AuthReply::default());
    }
}
