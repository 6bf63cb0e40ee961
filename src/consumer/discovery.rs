//! Source of broker endpoints for a topic.

use std::future::Future;
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

use crate::config::Endpoint;
use crate::error::Result;

/// Boxed future returned by [`Discovery::lookup`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Resolves the brokers currently carrying a topic.
///
/// Polled periodically by the consumer; any endpoint not yet connected is
/// connected to. An error skips one polling round.
pub trait Discovery: Send + Sync + 'static {
    /// Endpoints carrying `topic`.
    fn lookup<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<Vec<Endpoint>>>;
}

/// Fixed endpoint list, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl StaticDiscovery {
    /// Answer every lookup with `endpoints`.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    /// Replace the answer for later lookups.
    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        *self.endpoints.write().unwrap_or_else(PoisonError::into_inner) = endpoints;
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Discovery for StaticDiscovery {
    fn lookup<'a>(&'a self, _topic: &'a str) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        let endpoints = self.endpoints();
        Box::pin(async move { Ok(endpoints) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery_replaces_endpoints() {
        let discovery = StaticDiscovery::new(vec![Endpoint::new("a", 4150)]);
        assert_eq!(discovery.lookup("events").await.unwrap(), vec![Endpoint::new("a", 4150)]);

        discovery.set_endpoints(vec![Endpoint::new("b", 4150), Endpoint::new("c", 4150)]);
        let found = discovery.lookup("events").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].host, "b");
    }
}
