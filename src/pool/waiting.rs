use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use super::{MatchFound, QueueEntry, QueueStatus};
use crate::types::ParticipantId;

/// Candidate selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Most shared interests first, then longest waiting
    Weighted,
    /// Longest waiting, interests ignored
    Any,
}

/// Trim, lowercase and deduplicate; empty tags are dropped.
pub fn normalize_interests(interests: &[String]) -> Vec<String> {
    interests
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn shared_interests(a: &[String], b: &[String]) -> u32 {
    a.iter().filter(|tag| b.contains(tag)).count() as u32
}

/// Synchronous waiting-pool state. Not shareable by itself; the
/// [`MemoryPool`](super::MemoryPool) actor owns one and serializes access.
#[derive(Debug, Default)]
pub struct WaitingPool {
    entries: HashMap<ParticipantId, QueueEntry>,
    next_seq: u64,
}

impl WaitingPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Insert or replace the participant's entry as `searching`.
    pub fn enqueue(&mut self, participant: &ParticipantId, interests: &[String]) {
        let entry = QueueEntry {
            participant: participant.clone(),
            status: QueueStatus::Searching,
            matched_with: None,
            interests: normalize_interests(interests),
            seq: self.next_seq(),
        };
        self.entries.insert(participant.clone(), entry);
        debug!("Participant {} waiting ({} searching)", participant.short(), self.searching_count());
    }

    /// Pair `requester` with one other searching participant, flipping both
    /// entries to `matched`. A requester that is already matched gets its
    /// existing peer back.
    pub fn attempt_match(
        &mut self,
        requester: &ParticipantId,
        interests: &[String],
        selection: Selection,
    ) -> Option<MatchFound> {
        if let Some(existing) = self.entries.get(requester) {
            if let (QueueStatus::Matched, Some(peer)) = (existing.status, existing.matched_with.as_ref()) {
                let weight = self
                    .entries
                    .get(peer)
                    .map(|p| shared_interests(&existing.interests, &p.interests))
                    .unwrap_or(0);
                return Some(MatchFound {
                    peer: peer.clone(),
                    weight,
                });
            }
        }

        let interests = normalize_interests(interests);
        let candidates = self
            .entries
            .values()
            .filter(|e| e.status == QueueStatus::Searching && &e.participant != requester);

        let chosen = match selection {
            Selection::Weighted => candidates
                .max_by_key(|e| (shared_interests(&interests, &e.interests), Reverse(e.seq)))
                .map(|e| (e.participant.clone(), shared_interests(&interests, &e.interests))),
            Selection::Any => candidates
                .min_by_key(|e| e.seq)
                .map(|e| (e.participant.clone(), shared_interests(&interests, &e.interests))),
        };
        let (peer, weight) = chosen?;

        if let Some(target) = self.entries.get_mut(&peer) {
            target.status = QueueStatus::Matched;
            target.matched_with = Some(requester.clone());
        }

        let seq = match self.entries.get(requester) {
            Some(entry) => entry.seq,
            None => self.next_seq(),
        };
        self.entries.insert(
            requester.clone(),
            QueueEntry {
                participant: requester.clone(),
                status: QueueStatus::Matched,
                matched_with: Some(peer.clone()),
                interests,
                seq,
            },
        );

        info!("Matched {} with {} (weight {})", requester.short(), peer.short(), weight);
        Some(MatchFound { peer, weight })
    }

    pub fn matched_peer(&self, participant: &ParticipantId) -> Option<ParticipantId> {
        self.entries
            .get(participant)
            .filter(|e| e.status == QueueStatus::Matched)
            .and_then(|e| e.matched_with.clone())
    }

    pub fn searching_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == QueueStatus::Searching)
            .count()
    }

    pub fn remove(&mut self, participant: &ParticipantId) -> Option<QueueEntry> {
        let removed = self.entries.remove(participant);
        if removed.is_some() {
            debug!("Participant {} removed from pool", participant.short());
        }
        removed
    }

    pub fn entry(&self, participant: &ParticipantId) -> Option<&QueueEntry> {
        self.entries.get(participant)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
