use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, info};

use super::messages::ServerMessage;
use crate::types::Topic;

/// Server-side identity of one WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(pub u64);

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes,
/// so one serialized broadcast is shared by every subscriber.
#[derive(Debug, Clone)]
pub(crate) struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

impl From<&ServerMessage> for OutboundMessage {
    fn from(msg: &ServerMessage) -> Self {
        let json = serde_json::to_string(msg).expect("ServerMessage serialization should never fail");
        Self::from(json)
    }
}

/// Commands sent to the topic hub actor
pub(crate) enum HubCommand {
    Subscribe {
        conn: ConnectionId,
        topic: Topic,
        tx: mpsc::UnboundedSender<OutboundMessage>,
    },
    Unsubscribe {
        conn: ConnectionId,
        topic: Topic,
    },
    Publish {
        conn: ConnectionId,
        topic: Topic,
        envelope: Value,
    },
    Disconnect {
        conn: ConnectionId,
    },
}

pub(crate) async fn topic_hub_actor(mut rx: mpsc::Receiver<HubCommand>) {
    let mut topics: HashMap<Topic, HashMap<ConnectionId, mpsc::UnboundedSender<OutboundMessage>>> = HashMap::new();
    let mut conn_topics: HashMap<ConnectionId, HashSet<Topic>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Subscribe { conn, topic, tx } => {
                let ack = OutboundMessage::from(&ServerMessage::Subscribed { topic: topic.clone() });
                let _ = tx.send(ack);

                topics.entry(topic.clone()).or_default().insert(conn, tx);
                conn_topics.entry(conn).or_default().insert(topic.clone());
                info!("Connection {} subscribed to {}", conn.0, topic);
            }

            HubCommand::Unsubscribe { conn, topic } => {
                if let Some(set) = conn_topics.get_mut(&conn) {
                    set.remove(&topic);
                }
                remove_subscriber(&mut topics, &topic, conn);
            }

            HubCommand::Publish { conn, topic, envelope } => {
                let Some(subscribers) = topics.get(&topic) else {
                    debug!("Publish from {} on {} with no subscribers", conn.0, topic);
                    continue;
                };
                let msg = OutboundMessage::from(&ServerMessage::Broadcast {
                    topic: topic.clone(),
                    envelope,
                });
                for tx in subscribers.values() {
                    let _ = tx.send(msg.clone());
                }
            }

            HubCommand::Disconnect { conn } => {
                if let Some(set) = conn_topics.remove(&conn) {
                    for topic in set {
                        remove_subscriber(&mut topics, &topic, conn);
                    }
                    info!("Connection {} removed from all topics", conn.0);
                }
            }
        }
    }
}

fn remove_subscriber(
    topics: &mut HashMap<Topic, HashMap<ConnectionId, mpsc::UnboundedSender<OutboundMessage>>>,
    topic: &Topic,
    conn: ConnectionId,
) {
    if let Some(subscribers) = topics.get_mut(topic) {
        subscribers.remove(&conn);
        if subscribers.is_empty() {
            topics.remove(topic);
            info!("Topic {} removed (empty)", topic);
        }
    }
}

/// Handle to communicate with the topic hub actor
#[derive(Clone)]
pub(crate) struct TopicHubHandle {
    pub(crate) tx: mpsc::Sender<HubCommand>,
}

impl TopicHubHandle {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<HubCommand>(1024);
        tokio::spawn(topic_hub_actor(rx));
        Self { tx }
    }

    pub async fn subscribe(&self, conn: ConnectionId, topic: Topic, tx: mpsc::UnboundedSender<OutboundMessage>) {
        let _ = self.tx.send(HubCommand::Subscribe { conn, topic, tx }).await;
    }

    pub async fn unsubscribe(&self, conn: ConnectionId, topic: Topic) {
        let _ = self.tx.send(HubCommand::Unsubscribe { conn, topic }).await;
    }

    pub async fn publish(&self, conn: ConnectionId, topic: Topic, envelope: Value) {
        let _ = self.tx.send(HubCommand::Publish { conn, topic, envelope }).await;
    }

    pub async fn disconnect(&self, conn: ConnectionId) {
        let _ = self.tx.send(HubCommand::Disconnect { conn }).await;
    }
}
