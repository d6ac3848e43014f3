//! Redis pub/sub cluster transport
//!
//! Publishes go through a shared connection manager. A single background
//! task owns the pub/sub connection, subscribes one Redis channel per
//! namespace, and fans deliveries out to every local subscriber.

use async_trait::async_trait;
use futures::{StreamExt, stream};
use redis::{AsyncCommands, aio::ConnectionManager};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{CacheError, ClusterTransport, MessageStream};

/// Prefix of the Redis channel carrying a namespace's invalidations
pub const CHANNEL_PREFIX: &str = "gridcache:invalidate:";

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const POLL_WINDOW: Duration = Duration::from_millis(250);
const MAX_SUBSCRIBE_ATTEMPTS: u32 = 5;

pub fn channel_for(namespace: &str) -> String {
    format!("{CHANNEL_PREFIX}{namespace}")
}

enum ControlMsg {
    Register {
        channel: String,
        sender: mpsc::UnboundedSender<String>,
    },
}

pub struct RedisTransport {
    publisher: ConnectionManager,
    control: mpsc::UnboundedSender<ControlMsg>,
    shutdown_flag: Arc<AtomicBool>,
}

impl RedisTransport {
    /// Connect to Redis and start the subscriber task on the current runtime.
    pub async fn connect(client: redis::Client) -> Result<Self, CacheError> {
        let publisher = ConnectionManager::new(client.clone()).await?;
        let pubsub = client.get_async_pubsub().await?;
        let (control, rx) = mpsc::unbounded_channel();
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_hub(
            client,
            pubsub,
            publisher.clone(),
            rx,
            Arc::clone(&shutdown_flag),
        ));
        Ok(Self {
            publisher,
            control,
            shutdown_flag,
        })
    }

    /// Stop the subscriber task. Open message streams end.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ClusterTransport for RedisTransport {
    async fn broadcast(&self, namespace: &str, payload: String) -> Result<(), CacheError> {
        let channel = channel_for(namespace);
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(&channel, payload).await?;
        debug!("Published invalidation on Redis channel '{}'", channel);
        Ok(())
    }

    async fn subscribe(&self, namespace: &str) -> Result<MessageStream, CacheError> {
        let (sender, rx) = mpsc::unbounded_channel();
        self.control
            .send(ControlMsg::Register {
                channel: channel_for(namespace),
                sender,
            })
            .map_err(|_| CacheError::Transport("Redis subscriber task has stopped".into()))?;
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        })))
    }
}

/// Subscribe with exponential backoff. Returns whether it succeeded.
async fn subscribe_with_backoff(pubsub: &mut redis::aio::PubSub, channel: &str) -> bool {
    let mut delay_ms = 100u64;
    for attempt in 1..=MAX_SUBSCRIBE_ATTEMPTS {
        match pubsub.subscribe(channel).await {
            Ok(()) => {
                debug!("RedisTransport: subscribed to channel {}", channel);
                return true;
            }
            Err(e) => {
                warn!(
                    "RedisTransport: subscribe attempt {} failed for {}: {}",
                    attempt, channel, e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = delay_ms.saturating_mul(2).min(2000);
            }
        }
    }
    warn!(
        "RedisTransport: subscribe failed for channel {} after {} attempts, will retry during health check",
        channel, MAX_SUBSCRIBE_ATTEMPTS
    );
    false
}

async fn run_hub(
    client: redis::Client,
    mut pubsub: redis::aio::PubSub,
    mut health_conn: ConnectionManager,
    mut control: mpsc::UnboundedReceiver<ControlMsg>,
    shutdown_flag: Arc<AtomicBool>,
) {
    let mut senders: HashMap<String, Vec<mpsc::UnboundedSender<String>>> = HashMap::new();
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut last_health_check = Instant::now();

    while !shutdown_flag.load(Ordering::SeqCst) {
        loop {
            match control.try_recv() {
                Ok(ControlMsg::Register { channel, sender }) => {
                    senders.entry(channel.clone()).or_default().push(sender);
                    if !subscribed.contains(&channel)
                        && subscribe_with_backoff(&mut pubsub, &channel).await
                    {
                        subscribed.insert(channel);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("RedisTransport: transport dropped, stopping subscriber task");
                    return;
                }
            }
        }

        if last_health_check.elapsed() >= HEALTH_INTERVAL {
            last_health_check = Instant::now();
            if let Err(e) = redis::cmd("PING").query_async::<String>(&mut health_conn).await {
                warn!("RedisTransport: PING failed ({}); reconnecting pub/sub", e);
                match client.get_async_pubsub().await {
                    Ok(fresh) => {
                        pubsub = fresh;
                        subscribed.clear();
                    }
                    Err(e) => error!("RedisTransport: reconnection failed: {}", e),
                }
            }
            senders.retain(|_, list| {
                list.retain(|s| !s.is_closed());
                !list.is_empty()
            });
            let pending: Vec<String> = senders
                .keys()
                .filter(|ch| !subscribed.contains(*ch))
                .cloned()
                .collect();
            for channel in pending {
                match pubsub.subscribe(&channel).await {
                    Ok(()) => {
                        debug!("RedisTransport: subscribed to channel {}", channel);
                        subscribed.insert(channel);
                    }
                    Err(e) => warn!(
                        "RedisTransport: health check failed to subscribe to {}: {}",
                        channel, e
                    ),
                }
            }
        }

        let deadline = tokio::time::Instant::now() + POLL_WINDOW;
        let mut messages = pubsub.on_message();
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, messages.next()).await {
            let channel = msg.get_channel_name();
            match msg.get_payload::<String>() {
                Ok(payload) => match senders.get(channel) {
                    Some(list) => {
                        for sender in list {
                            let _ = sender.send(payload.clone());
                        }
                    }
                    None => debug!("RedisTransport: no subscribers for channel {}", channel),
                },
                Err(e) => warn!("RedisTransport: failed to decode pub/sub payload: {}", e),
            }
        }
    }
    debug!("RedisTransport: subscriber task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InvalidationBus, InvalidationMessage, Operation};

    #[test]
    fn namespaces_map_to_prefixed_channels() {
        assert_eq!(channel_for("products"), "gridcache:invalidate:products");
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn round_trips_through_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let transport = RedisTransport::connect(redis::Client::open(url).unwrap())
            .await
            .unwrap();
        let bus = InvalidationBus::new(Arc::new(transport));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus
            .subscribe::<u64, _>("redis-test", move |m| {
                let _ = tx.send(m.version());
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        bus.publish(&InvalidationMessage::new("redis-test", 1u64, Operation::Put, 4, "a".into()))
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got, Some(4));
    }
}
