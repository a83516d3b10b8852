pub mod redis;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub use self::redis::RedisPubSub;

/// Buffered messages per subscriber before publishes start dropping
const SUBSCRIBER_BUFFER: usize = 100;

/// Error returned by the broadcast fabric
#[derive(Debug)]
pub enum PubSubError {
    Connection(String),
    Publish(String),
    Subscribe(String),
}

impl std::fmt::Display for PubSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubError::Connection(e) => write!(f, "broker connection error: {}", e),
            PubSubError::Publish(e) => write!(f, "broker publish error: {}", e),
            PubSubError::Subscribe(e) => write!(f, "broker subscribe error: {}", e),
        }
    }
}

impl std::error::Error for PubSubError {}

/// Cross-instance broadcast fabric.
///
/// Every instance publishes its locally originated envelopes on a well-known
/// channel and receives every published envelope back, its own included.
/// Production uses redis, tests substitute the in-memory fabric.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError>;

    /// Open a subscription on `channel`. Messages published after this call
    /// are delivered to the returned receiver in publish order.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, PubSubError>;
}

/// In-process fabric with the same loopback semantics as the broker:
/// a publish is delivered to every subscriber of the channel, including one
/// owned by the publishing instance.
#[derive(Default)]
pub struct MemoryPubSub {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError> {
        let mut subscribers = self.subscribers.lock().expect("subscriber map poisoned");
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|tx| tx.try_send(payload.clone()).is_ok() || !tx.is_closed());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, PubSubError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
