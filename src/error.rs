//! Error types for nsq-client.

use thiserror::Error;

use crate::protocol::MessageId;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum NsqError {
    /// I/O error on the socket or a transport layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (IDENTIFY and AUTH bodies).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Frame header or body could not be parsed.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame type outside 0 (response), 1 (error), 2 (message).
    #[error("Unknown frame type: {0}")]
    UnknownFrameType(i32),

    /// Server answered a command with one of its declared errors.
    #[error("Bad response to {command}: {error}")]
    BadResponse {
        /// Command name (e.g. `SUB`).
        command: &'static str,
        /// Error payload sent by the server.
        error: String,
    },

    /// No response arrived for a command that requires one.
    #[error("No response received for {0}")]
    NoResponse(&'static str),

    /// Connection is not usable right now (reconnecting or not yet ready).
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Reconnect budget exhausted; the connection has been torn down.
    #[error("Connection failed after {attempts} reconnect attempts")]
    ConnectionFailure {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Message or connection not present in the flow registry.
    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    /// Message ID is already registered as in flight.
    #[error("Message already in flight: {0}")]
    AlreadyInFlight(MessageId),

    /// Invalid construction arguments.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required negotiated feature was not granted by the server.
    #[error("Connection feature failure: {0}")]
    FeatureFailure(String),

    /// Stream transform decode error (checksum mismatch, unknown chunk).
    #[error("Stream transform error: {0}")]
    Transform(String),

    /// Connection closed or terminated.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl NsqError {
    /// Errors that terminate a connection without a reconnect attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NsqError::MalformedFrame(_) | NsqError::UnknownFrameType(_) | NsqError::Transform(_)
        )
    }

    /// Errors caused by the transport going away, recovered by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NsqError::Io(_) | NsqError::ConnectionClosed | NsqError::ConnectionUnavailable(_)
        )
    }

    /// Map an I/O error raised inside a transport layer.
    ///
    /// Layers report decode failures as `InvalidData`; those become
    /// [`NsqError::Transform`] so they are treated as fatal.
    pub(crate) fn from_transport(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::InvalidData {
            NsqError::Transform(err.to_string())
        } else {
            NsqError::Io(err)
        }
    }
}

/// Result type alias using NsqError.
pub type Result<T> = std::result::Result<T, NsqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_and_transient_classes() {
        assert!(NsqError::MalformedFrame("short".into()).is_fatal());
        assert!(NsqError::UnknownFrameType(7).is_fatal());
        assert!(NsqError::Transform("crc".into()).is_fatal());
        assert!(!NsqError::ConnectionClosed.is_fatal());

        assert!(NsqError::ConnectionClosed.is_transient());
        assert!(NsqError::Io(std::io::Error::other("reset")).is_transient());
        assert!(!NsqError::NoResponse("SUB").is_transient());
    }

    #[test]
    fn test_invalid_data_maps_to_transform() {
        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "checksum mismatch");
        assert!(matches!(NsqError::from_transport(err), NsqError::Transform(_)));

        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(NsqError::from_transport(err), NsqError::Io(_)));
    }

    #[test]
    fn test_bad_response_display() {
        let err = NsqError::BadResponse {
            command: "PUB",
            error: "E_BAD_TOPIC".into(),
        };
        assert_eq!(err.to_string(), "Bad response to PUB: E_BAD_TOPIC");
    }
}
