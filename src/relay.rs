//! Addressed pub/sub relay: the collaborator contract, an in-process hub, the
//! WebSocket relay server and client, and the per-participant relay client.

mod client;
mod hub;
mod memory;
mod messages;
mod server;
mod ws;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signal::SignalEnvelope;
use crate::types::Topic;

pub use client::{Inbox, RelayClient};
pub use memory::MemoryRelay;
pub use messages::{ClientMessage, ServerMessage};
pub use server::{DEFAULT_RELAY_PORT, RelayServer, default_bind_addr};
pub use ws::WsRelay;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay connection closed")]
    Closed,

    #[error("relay transport error: {0}")]
    Transport(String),

    #[error("relay codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Live subscription to one topic. Dropping it releases the subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    rx: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl Subscription {
    pub fn new(topic: Topic, rx: mpsc::UnboundedReceiver<SignalEnvelope>) -> Self {
        Self { topic, rx }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next envelope on the topic; `None` once the relay dropped us.
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.rx.recv().await
    }
}

/// Shared-topic relay with at-most-once, unordered, unacknowledged delivery.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    async fn publish(&self, topic: &Topic, envelope: SignalEnvelope) -> Result<(), RelayError>;

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, RelayError>;
}
