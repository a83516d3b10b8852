use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{PubSub, PubSubError};

/// Buffered messages between the redis subscriber and the hub
const SUBSCRIBER_BUFFER: usize = 100;

/// Redis-backed broadcast fabric.
///
/// Publishes go through a shared multiplexed connection, each subscription
/// holds its own dedicated pub/sub connection as redis requires.
pub struct RedisPubSub {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisPubSub {
    /// Connect to the broker and verify liveness with a ping.
    /// A failed ping is logged but not fatal, the broker may come up later.
    pub async fn connect(redis_url: &str) -> Result<Self, PubSubError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))?;

        let mut ping_conn = conn.clone();
        let ping: Result<String, _> = redis::cmd("PING").query_async(&mut ping_conn).await;
        match ping {
            Ok(_) => info!("Connected to redis at {}", redis_url),
            Err(e) => warn!("Redis ping failed: {}", e),
        }

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = conn.publish(channel, payload).await;
        result.map_err(|e| PubSubError::Publish(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, PubSubError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| PubSubError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| PubSubError::Subscribe(e.to_string()))?;

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            // Receiver side gone, the hub is shutting down
                            break;
                        }
                    }
                    Err(e) => warn!("Undecodable message on channel {}: {}", channel, e),
                }
            }
            info!("Redis subscription on {} closed", channel);
        });

        Ok(rx)
    }
}
