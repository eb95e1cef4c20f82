use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{Relay, RelayError, Subscription};
use crate::signal::SignalEnvelope;
use crate::types::Topic;

enum MemoryCommand {
    Publish {
        topic: Topic,
        envelope: SignalEnvelope,
    },
    Subscribe {
        topic: Topic,
        tx: mpsc::UnboundedSender<SignalEnvelope>,
        reply: oneshot::Sender<()>,
    },
}

async fn memory_relay_actor(mut rx: mpsc::Receiver<MemoryCommand>) {
    let mut topics: HashMap<Topic, Vec<mpsc::UnboundedSender<SignalEnvelope>>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            MemoryCommand::Publish { topic, envelope } => {
                let Some(subscribers) = topics.get_mut(&topic) else {
                    debug!("Publish on {} with no subscribers", topic);
                    continue;
                };
                subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
                if subscribers.is_empty() {
                    topics.remove(&topic);
                    info!("Topic {} removed (no subscribers)", topic);
                }
            }

            MemoryCommand::Subscribe { topic, tx, reply } => {
                topics.entry(topic).or_default().push(tx);
                let _ = reply.send(());
            }
        }
    }
}

/// In-process relay hub. Cloning shares the same hub.
#[derive(Clone)]
pub struct MemoryRelay {
    tx: mpsc::Sender<MemoryCommand>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(memory_relay_actor(rx));
        Self { tx }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn publish(&self, topic: &Topic, envelope: SignalEnvelope) -> Result<(), RelayError> {
        self.tx
            .send(MemoryCommand::Publish {
                topic: topic.clone(),
                envelope,
            })
            .await
            .map_err(|_| RelayError::Closed)
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MemoryCommand::Subscribe {
                topic: topic.clone(),
                tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RelayError::Closed)?;
        reply_rx.await.map_err(|_| RelayError::Closed)?;
        Ok(Subscription::new(topic.clone(), rx))
    }
}
