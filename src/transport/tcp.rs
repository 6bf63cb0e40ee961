//! TCP connection setup.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Endpoint;
use crate::error::{NsqError, Result};

/// Open a TCP stream to `endpoint` within `timeout`.
///
/// Nagle is disabled; commands are small and latency-sensitive.
pub async fn connect_tcp(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(
        timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| NsqError::ConnectionUnavailable(format!("connect to {} timed out", endpoint)))??;
    stream.set_nodelay(true)?;
    debug!(%endpoint, "tcp connected");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect_tcp(&Endpoint::new("127.0.0.1", port), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect_tcp(&Endpoint::new("127.0.0.1", port), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(NsqError::Io(_))));
    }
}
