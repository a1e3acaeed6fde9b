//! Channel and pattern publish/subscribe.
//!
//! Uses tokio broadcast channels for O(1) fan-out per channel. A
//! pattern subscription (`thread:*`) receives every message published
//! to a matching channel; the registry uses one to tail all thread
//! channels.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

/// Buffered messages per subscriber before lagging ones drop.
const CHANNEL_CAPACITY: usize = 256;

/// A message delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Published {
    pub channel: Arc<str>,
    pub payload: Arc<str>,
}

struct PatternSub {
    pattern: String,
    tx: broadcast::Sender<Published>,
}

/// In-process pub/sub hub.
pub struct PubSub {
    channels: RwLock<HashMap<String, broadcast::Sender<Published>>>,
    patterns: RwLock<Vec<PatternSub>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            patterns: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to one channel.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Published> {
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every channel matching a glob pattern. Only a
    /// single trailing `*` wildcard is supported.
    pub fn psubscribe(&self, pattern: &str) -> broadcast::Receiver<Published> {
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        self.patterns.write().unwrap().push(PatternSub {
            pattern: pattern.to_string(),
            tx,
        });
        rx
    }

    /// Publish to a channel. Returns the number of subscribers the
    /// message reached.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let msg = Published {
            channel: channel.into(),
            payload: payload.into(),
        };
        let mut reached = 0;

        if let Some(tx) = self.channels.read().unwrap().get(channel) {
            reached += tx.send(msg.clone()).unwrap_or(0);
        }

        let mut patterns = self.patterns.write().unwrap();
        patterns.retain(|p| p.tx.receiver_count() > 0);
        for p in patterns.iter() {
            if pattern_matches(&p.pattern, channel) {
                reached += p.tx.send(msg.clone()).unwrap_or(0);
            }
        }
        reached
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, "")) => channel.starts_with(prefix),
        Some(_) => false,
        None => pattern == channel,
    }
}
