use crate::relay::RelayClient;
use crate::types::{ParticipantId, Role, Topic};

/// A formed pairing, however it was formed: the matched peer plus the relay
/// client already subscribed to the topic both sides negotiate on.
#[derive(Debug, Clone)]
pub struct Pairing {
    pub local: ParticipantId,
    pub peer: ParticipantId,
    pub role: Role,
    pub relay: RelayClient,
}

impl Pairing {
    pub fn new(peer: ParticipantId, relay: RelayClient) -> Self {
        let local = relay.local().clone();
        let role = Role::for_pair(&local, &peer);
        Self {
            local,
            peer,
            role,
            relay,
        }
    }

    pub fn topic(&self) -> &Topic {
        self.relay.topic()
    }

    /// A pairing whose relay client was already released belongs to a
    /// superseded join and must not start a session.
    pub fn is_stale(&self) -> bool {
        self.relay.is_closed()
    }
}
