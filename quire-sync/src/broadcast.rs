//! Fan-out of server messages to the subscribers of one session.
//!
//! Each subscriber owns an unbounded mpsc queue drained by its
//! connection's writer task, so every connection sees messages in the
//! exact order the session produced them. A message is JSON-encoded once
//! and shared by `Arc` across all queues.
//!
//! Sends happen under the read lock. A subscriber whose queue is closed
//! (connection gone) is collected during the pass and removed afterwards
//! under the write lock, never while iterating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Command, ProtocolError, ServerMessage};

/// A server message encoded once for every recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl EncodedMessage {
    pub fn encode(msg: &ServerMessage) -> Result<Arc<Self>, ProtocolError> {
        Ok(Arc::new(Self {
            command: msg.command(),
            payload: msg.encode_payload()?,
        }))
    }

    pub fn decode(&self) -> Result<ServerMessage, ProtocolError> {
        ServerMessage::decode(self.command as u8, &self.payload)
    }
}

pub type OutboundTx = mpsc::UnboundedSender<Arc<EncodedMessage>>;
pub type OutboundRx = mpsc::UnboundedReceiver<Arc<EncodedMessage>>;

/// One attached connection.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub conn_id: Uuid,
    /// Display identity of the connection's user
    pub user: String,
    pub tx: OutboundTx,
}

impl Subscriber {
    pub fn new(conn_id: Uuid, user: impl Into<String>, tx: OutboundTx) -> Self {
        Self {
            conn_id,
            user: user.into(),
            tx,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters for the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
}

#[derive(Default)]
pub struct BroadcastGroup {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, subscriber: Subscriber) {
        self.subscribers
            .write()
            .await
            .insert(subscriber.conn_id, subscriber);
    }

    pub async fn remove(&self, conn_id: &Uuid) -> Option<Subscriber> {
        self.subscribers.write().await.remove(conn_id)
    }

    /// Send to every subscriber. Returns how many queues accepted it.
    pub async fn broadcast(&self, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let encoded = EncodedMessage::encode(msg)?;
        Ok(self.fan_out(encoded, None).await)
    }

    /// Send to every subscriber except `conn_id`.
    pub async fn broadcast_except(&self, msg: &ServerMessage, conn_id: Uuid) -> Result<usize, ProtocolError> {
        let encoded = EncodedMessage::encode(msg)?;
        Ok(self.fan_out(encoded, Some(conn_id)).await)
    }

    /// Pre-encoded fast path.
    pub async fn fan_out(&self, encoded: Arc<EncodedMessage>, skip: Option<Uuid>) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (conn_id, subscriber) in subscribers.iter() {
                if Some(*conn_id) == skip {
                    continue;
                }
                if subscriber.tx.send(encoded.clone()).is_ok() {
                    delivered += 1;
                } else {
                    failed.push(*conn_id);
                }
            }
        }

        self.atomic_stats
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if !failed.is_empty() {
            self.atomic_stats
                .messages_failed
                .fetch_add(failed.len() as u64, Ordering::Relaxed);
            self.prune(&failed).await;
        }
        delivered
    }

    async fn prune(&self, conn_ids: &[Uuid]) {
        let mut subscribers = self.subscribers.write().await;
        for conn_id in conn_ids {
            if let Some(gone) = subscribers.remove(conn_id) {
                log::debug!("Dropped closed subscriber {} ({})", gone.user, conn_id);
            }
        }
    }

    /// Direct reply to one subscriber.
    pub async fn send_to(&self, conn_id: &Uuid, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let encoded = EncodedMessage::encode(msg)?;
        let subscribers = self.subscribers.read().await;
        Ok(subscribers
            .get(conn_id)
            .is_some_and(|s| s.tx.send(encoded).is_ok()))
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    pub async fn contains(&self, conn_id: &Uuid) -> bool {
        self.subscribers.read().await.contains_key(conn_id)
    }

    /// Users currently attached, one entry per connection.
    pub async fn users(&self) -> Vec<String> {
        self.subscribers
            .read()
            .await
            .values()
            .map(|s| s.user.clone())
            .collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.atomic_stats.messages_failed.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }
}
