//! Waiting pool: queue entries, the atomic matcher contract the matchmaker
//! depends on, and an in-memory implementation of it.

mod actor;
mod waiting;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ParticipantId;

pub use actor::MemoryPool;
pub use waiting::{Selection, WaitingPool, normalize_interests};

/// Matcher failures. A pool with nobody waiting is not an error; it is
/// [`MatchOutcome::NoCandidate`].
#[derive(Debug, Error)]
pub enum MatchError {
    /// The matcher cannot be reached; the caller may fall back.
    #[error("matcher unavailable: {0}")]
    Unavailable(String),

    /// The matcher answered but rejected the request.
    #[error("pool store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Searching,
    Matched,
}

/// One participant's row in the waiting pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub participant: ParticipantId,
    pub status: QueueStatus,
    pub matched_with: Option<ParticipantId>,
    pub interests: Vec<String>,
    /// Insertion order; lower waited longer
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFound {
    pub peer: ParticipantId,
    /// Number of shared interests
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(MatchFound),
    NoCandidate,
}

/// Atomic pool matcher.
///
/// `attempt_match` must select another `searching` entry and flip both
/// entries to `matched` with mutual pointers in one step; two concurrent
/// attempts can never claim the same third participant.
#[async_trait]
pub trait PoolMatcher: Send + Sync {
    async fn attempt_match(&self, participant: &ParticipantId, interests: &[String])
    -> Result<MatchOutcome, MatchError>;

    /// Insert (or replace) a `searching` entry.
    async fn enqueue(&self, participant: &ParticipantId, interests: &[String]) -> Result<(), MatchError>;

    async fn poll_matched_peer(&self, participant: &ParticipantId) -> Result<Option<ParticipantId>, MatchError>;

    /// Number of `searching` entries
    async fn current_pool_size(&self) -> Result<usize, MatchError>;

    /// Delete the participant's entry. Removing an absent entry is not an error.
    async fn remove_from_pool(&self, participant: &ParticipantId) -> Result<(), MatchError>;
}
