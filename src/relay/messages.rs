use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Topic;

/// Messages sent from relay client to relay server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start receiving broadcasts on a topic
    #[serde(rename = "subscribe")]
    Subscribe { topic: Topic },

    /// Stop receiving broadcasts on a topic
    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: Topic },

    /// Broadcast an envelope to every subscriber of a topic.
    /// The envelope is relayed as-is; the server never inspects it.
    #[serde(rename = "publish")]
    Publish { topic: Topic, envelope: Value },
}

/// Messages sent from relay server to relay client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Subscription registered; broadcasts published after this are delivered
    #[serde(rename = "subscribed")]
    Subscribed { topic: Topic },

    /// An envelope published on a subscribed topic
    #[serde(rename = "broadcast")]
    Broadcast { topic: Topic, envelope: Value },

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },
}
