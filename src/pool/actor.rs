use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::waiting::{Selection, WaitingPool};
use super::{MatchError, MatchFound, MatchOutcome, PoolMatcher};
use crate::types::ParticipantId;

/// Commands sent to the pool actor
enum PoolCommand {
    AttemptMatch {
        participant: ParticipantId,
        interests: Vec<String>,
        selection: Selection,
        reply: oneshot::Sender<Option<MatchFound>>,
    },
    Enqueue {
        participant: ParticipantId,
        interests: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    PollMatched {
        participant: ParticipantId,
        reply: oneshot::Sender<Option<ParticipantId>>,
    },
    Size {
        reply: oneshot::Sender<usize>,
    },
    Remove {
        participant: ParticipantId,
        reply: oneshot::Sender<()>,
    },
}

/// Every command runs to completion before the next one starts, which is
/// what makes `AttemptMatch` atomic.
async fn pool_actor(mut rx: mpsc::Receiver<PoolCommand>) {
    let mut pool = WaitingPool::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            PoolCommand::AttemptMatch {
                participant,
                interests,
                selection,
                reply,
            } => {
                let _ = reply.send(pool.attempt_match(&participant, &interests, selection));
            }

            PoolCommand::Enqueue {
                participant,
                interests,
                reply,
            } => {
                pool.enqueue(&participant, &interests);
                let _ = reply.send(());
            }

            PoolCommand::PollMatched { participant, reply } => {
                let _ = reply.send(pool.matched_peer(&participant));
            }

            PoolCommand::Size { reply } => {
                let _ = reply.send(pool.searching_count());
            }

            PoolCommand::Remove { participant, reply } => {
                pool.remove(&participant);
                let _ = reply.send(());
            }
        }
    }

    info!("Pool actor stopped with {} entries", pool.len());
}

/// Handle to an in-memory waiting pool actor.
///
/// Clones share the same pool. [`MemoryPool::interest_agnostic`] gives a
/// handle to the same pool that ignores interests when selecting.
#[derive(Clone)]
pub struct MemoryPool {
    tx: mpsc::Sender<PoolCommand>,
    selection: Selection,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::spawn()
    }
}

impl MemoryPool {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<PoolCommand>(1024);
        tokio::spawn(pool_actor(rx));
        Self {
            tx,
            selection: Selection::Weighted,
        }
    }

    pub fn interest_agnostic(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            selection: Selection::Any,
        }
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    async fn request<T>(&self, cmd: PoolCommand, reply_rx: oneshot::Receiver<T>) -> Result<T, MatchError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| MatchError::Unavailable("pool actor stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| MatchError::Unavailable("pool actor dropped the request".to_string()))
    }
}

#[async_trait]
impl PoolMatcher for MemoryPool {
    async fn attempt_match(
        &self,
        participant: &ParticipantId,
        interests: &[String],
    ) -> Result<MatchOutcome, MatchError> {
        let (reply, reply_rx) = oneshot::channel();
        let cmd = PoolCommand::AttemptMatch {
            participant: participant.clone(),
            interests: interests.to_vec(),
            selection: self.selection,
            reply,
        };
        let found = self.request(cmd, reply_rx).await?;
        Ok(match found {
            Some(found) => MatchOutcome::Matched(found),
            None => MatchOutcome::NoCandidate,
        })
    }

    async fn enqueue(&self, participant: &ParticipantId, interests: &[String]) -> Result<(), MatchError> {
        let (reply, reply_rx) = oneshot::channel();
        let cmd = PoolCommand::Enqueue {
            participant: participant.clone(),
            interests: interests.to_vec(),
            reply,
        };
        self.request(cmd, reply_rx).await
    }

    async fn poll_matched_peer(&self, participant: &ParticipantId) -> Result<Option<ParticipantId>, MatchError> {
        let (reply, reply_rx) = oneshot::channel();
        let cmd = PoolCommand::PollMatched {
            participant: participant.clone(),
            reply,
        };
        self.request(cmd, reply_rx).await
    }

    async fn current_pool_size(&self) -> Result<usize, MatchError> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(PoolCommand::Size { reply }, reply_rx).await
    }

    async fn remove_from_pool(&self, participant: &ParticipantId) -> Result<(), MatchError> {
        let (reply, reply_rx) = oneshot::channel();
        let cmd = PoolCommand::Remove {
            participant: participant.clone(),
            reply,
        };
        self.request(cmd, reply_rx).await
    }
}
