//! Invalidation bus
//!
//! Publishing only enqueues: a background pump hands payloads to the
//! transport, so a mutation never waits on fan-out. The queue is bounded;
//! when it is full the message is dropped with a warning and peers fall
//! back to their TTL for that key. Each subscription is a
//! task that decodes deliveries for one namespace and calls its handler.

use futures::StreamExt;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{CacheError, ClusterTransport, InvalidationMessage};

/// Messages a bus queues for the transport before it starts dropping
pub const DEFAULT_PUBLISH_QUEUE: usize = 4096;

enum Outgoing {
    Publish { namespace: String, payload: String },
    Flush(oneshot::Sender<()>),
}

/// Handle to a running subscription; [`Subscription::cancel`] stops it.
///
/// Dropping the handle leaves the subscription running.
#[derive(Debug)]
pub struct Subscription {
    namespace: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct InvalidationBus {
    transport: Arc<dyn ClusterTransport>,
    tx: mpsc::Sender<Outgoing>,
    dropped: AtomicU64,
}

impl InvalidationBus {
    /// Start the publish pump. Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Arc<Self> {
        Self::with_capacity(transport, DEFAULT_PUBLISH_QUEUE)
    }

    /// Like [`InvalidationBus::new`], queueing at most `capacity` messages.
    pub fn with_capacity(transport: Arc<dyn ClusterTransport>, capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Outgoing>(capacity.max(1));
        let pump_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                match outgoing {
                    Outgoing::Publish { namespace, payload } => {
                        if let Err(e) = pump_transport.broadcast(&namespace, payload).await {
                            warn!(
                                "Invalidation broadcast on '{}' failed: {}. Near caches fall back to TTL.",
                                namespace, e
                            );
                        }
                    }
                    Outgoing::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Invalidation bus pump stopped");
        });
        Arc::new(Self {
            transport,
            tx,
            dropped: AtomicU64::new(0),
        })
    }

    /// Queue `message` for broadcast on its namespace. Never blocks; a full
    /// queue drops the message and counts it in [`InvalidationBus::dropped`].
    pub fn publish<K: Serialize>(&self, message: &InvalidationMessage<K>) -> Result<(), CacheError> {
        let payload = message.encode()?;
        match self.tx.try_send(Outgoing::Publish {
            namespace: message.namespace().to_owned(),
            payload,
        }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Invalidation queue full, dropping v{} on '{}'. Near caches fall back to TTL.",
                    message.version(),
                    message.namespace()
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(CacheError::Transport("invalidation bus pump has stopped".into()))
            }
        }
    }

    /// Messages dropped because the publish queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until everything published so far was handed to the transport.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Outgoing::Flush(done))
            .await
            .map_err(|_| CacheError::Transport("invalidation bus pump has stopped".into()))?;
        wait.await
            .map_err(|_| CacheError::Transport("invalidation bus pump has stopped".into()))
    }

    /// Invoke `handler` once per message delivered on `namespace`.
    ///
    /// Payloads that fail to decode, or that name another namespace, are
    /// logged and skipped.
    pub async fn subscribe<K, F>(&self, namespace: &str, handler: F) -> Result<Subscription, CacheError>
    where
        K: DeserializeOwned + Send + 'static,
        F: Fn(InvalidationMessage<K>) + Send + Sync + 'static,
    {
        let mut stream = self.transport.subscribe(namespace).await?;
        let ns = namespace.to_owned();
        let handle = tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                match InvalidationMessage::<K>::decode(&payload) {
                    Ok(message) if message.namespace() == ns => handler(message),
                    Ok(message) => debug!(
                        "Ignoring invalidation for namespace '{}' delivered on '{}'",
                        message.namespace(),
                        ns
                    ),
                    Err(e) => warn!("Undecodable invalidation payload on '{}': {}", ns, e),
                }
            }
            debug!("Invalidation subscription on '{}' ended", ns);
        });
        debug!("Subscribed to invalidations on '{}'", namespace);
        Ok(Subscription {
            namespace: namespace.to_owned(),
            handle,
        })
    }
}
