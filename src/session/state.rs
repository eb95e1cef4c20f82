use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use super::transport::IceCandidate;
use crate::types::{ParticipantId, Role};

/// Observable connection state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Failed | Closed, _) => false,
            (_, Closed | Failed) => true,
            (New, Connecting | Connected) => true,
            (Connecting, Connected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Per-pairing negotiation bookkeeping, owned by the session driver.
#[derive(Debug)]
pub struct Negotiation {
    pub peer: ParticipantId,
    pub role: Role,
    state: ConnectionState,
    /// Remote candidates received before a remote description was applied
    pending_remote_candidates: VecDeque<IceCandidate>,
    pub remote_description_set: bool,
    pub data_channel_ready: bool,
    pub ready_sent: bool,
    pub peer_ready: bool,
    pub offer_sent: bool,
    pub answer_sent: bool,
}

impl Negotiation {
    pub fn new(peer: ParticipantId, role: Role) -> Self {
        Self {
            peer,
            role,
            state: ConnectionState::New,
            pending_remote_candidates: VecDeque::new(),
            remote_description_set: false,
            data_channel_ready: false,
            ready_sent: false,
            peer_ready: false,
            offer_sent: false,
            answer_sent: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next` if that is a legal edge. Returns whether the state changed.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if self.state == next || !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    /// Hold the candidate until a remote description exists, or hand it
    /// back for immediate use. Nothing jumps the queue: while earlier
    /// candidates are still pending, later ones wait behind them.
    pub fn accept_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set && self.pending_remote_candidates.is_empty() {
            Some(candidate)
        } else {
            self.pending_remote_candidates.push_back(candidate);
            None
        }
    }

    /// Record that a remote description was applied and drain the held
    /// candidates in arrival order.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending_remote_candidates.drain(..).collect()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn should_create_offer(&self) -> bool {
        self.role.is_initiator() && self.ready_sent && self.peer_ready && !self.offer_sent
    }
}
