//! Anonymous one-to-one matchmaking and peer session negotiation

pub mod bridge;
pub mod config;
pub mod conversation;
pub mod matchmaker;
pub mod notify;
pub mod pairing;
pub mod pool;
pub mod relay;
pub mod session;
pub mod signal;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{BridgeError, DirectBridge};
pub use config::Config;
pub use conversation::{Collaborators, Conversation, ConversationError, ConversationEvent};
pub use matchmaker::{JoinError, JoinOutcome, MatchEvent, Matchmaker};
pub use notify::{LogNotifier, Notifier, Severity};
pub use pairing::Pairing;
pub use session::{ConnectionState, Session, SessionError, SessionEvent};
pub use types::{ParticipantId, Role, Topic};
