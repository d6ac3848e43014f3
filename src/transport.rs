//! Cluster transport seam
//!
//! The cache core only needs reliable broadcast: publish a payload on a
//! namespace and receive every payload published on it. Membership and
//! routing belong to whatever implements [`ClusterTransport`].

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::CacheError;

/// Stream of raw payloads delivered on one namespace
pub type MessageStream = BoxStream<'static, String>;

/// Broadcast delivery to every live cluster member.
///
/// Delivery must be at-least-once with best-effort ordering. A member that
/// subscribes late only sees messages published after it subscribed.
#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    async fn broadcast(&self, namespace: &str, payload: String) -> Result<(), CacheError>;

    async fn subscribe(&self, namespace: &str) -> Result<MessageStream, CacheError>;
}

/// In-process transport: every subscriber in this process is a "member".
///
/// Useful for embedding several nodes in one process and for tests.
pub struct LocalTransport {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LocalTransport {
    /// `capacity` bounds how far a slow subscriber may lag before it
    /// starts losing messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, namespace: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(namespace.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn broadcast(&self, namespace: &str, payload: String) -> Result<(), CacheError> {
        // No receivers just means no members are listening yet.
        let _ = self.sender(namespace).send(payload);
        Ok(())
    }

    async fn subscribe(&self, namespace: &str) -> Result<MessageStream, CacheError> {
        let rx = self.sender(namespace).subscribe();
        let namespace = namespace.to_owned();
        Ok(Box::pin(stream::unfold(
            (rx, namespace),
            |(mut rx, namespace)| async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, (rx, namespace))),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                "LocalTransport: subscriber on '{}' lagged, {} messages lost",
                                namespace, skipped
                            );
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        )))
    }
}
