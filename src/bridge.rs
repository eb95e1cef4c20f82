//! Direct pairing: two participants that already agreed to talk skip the
//! pool and go straight to negotiation on a well-known topic.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::BridgeConfig;
use crate::matchmaker::Matchmaker;
use crate::pairing::Pairing;
use crate::relay::{Relay, RelayClient, RelayError};
use crate::types::{ParticipantId, Topic};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot pair {0} with itself")]
    SelfPairing(ParticipantId),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}

pub struct DirectBridge {
    relay: Arc<dyn Relay>,
    topic: Topic,
}

impl DirectBridge {
    pub fn new(relay: Arc<dyn Relay>, config: &BridgeConfig) -> Self {
        Self {
            relay,
            topic: config.direct_topic.clone(),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Pair `local` with `peer` without polling. A live pool search of the
    /// local participant is abandoned first.
    pub async fn connect(
        &self,
        local: ParticipantId,
        peer: ParticipantId,
        matchmaker: Option<&Matchmaker>,
    ) -> Result<Pairing, BridgeError> {
        if local == peer {
            return Err(BridgeError::SelfPairing(local));
        }
        if let Some(matchmaker) = matchmaker {
            matchmaker.leave().await;
        }

        let client = RelayClient::attach(self.relay.clone(), self.topic.clone(), local).await?;
        let pairing = Pairing::new(peer, client);
        info!(
            "Direct pairing {} <-> {} on {} as {}",
            pairing.local.short(),
            pairing.peer.short(),
            self.topic,
            pairing.role
        );
        Ok(pairing)
    }
}
