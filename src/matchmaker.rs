//! Matchmaking coordinator: owns the local participant's queue entry, the
//! two polling timers and the pool relay subscription.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::config::MatchmakingConfig;
use crate::pairing::Pairing;
use crate::pool::{MatchError, MatchOutcome, PoolMatcher};
use crate::relay::{Relay, RelayClient, RelayError};
use crate::types::ParticipantId;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("matcher error: {0}")]
    Matcher(#[from] MatchError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("matchmaker stopped")]
    Stopped,
}

#[derive(Debug)]
pub enum JoinOutcome {
    /// Someone was already waiting; no polling was started.
    Matched(Pairing),
    /// Entered the pool; a later [`MatchEvent::Matched`] reports the peer.
    Searching,
}

/// Asynchronous progress of a search
#[derive(Debug)]
pub enum MatchEvent {
    Searching,
    /// Approximate number of other waiting participants
    PoolSize(usize),
    Matched(Pairing),
    Failed(String),
}

enum MatchCommand {
    Join {
        interests: Vec<String>,
        reply: oneshot::Sender<Result<JoinOutcome, JoinError>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn poll_timer(period: std::time::Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct Search {
    interests: Vec<String>,
    matcher: Arc<dyn PoolMatcher>,
}

struct Coordinator {
    local: ParticipantId,
    primary: Arc<dyn PoolMatcher>,
    fallback: Option<Arc<dyn PoolMatcher>>,
    relay: Arc<dyn Relay>,
    config: MatchmakingConfig,
    events: mpsc::UnboundedSender<MatchEvent>,
    search: Option<Search>,
    match_poll: Option<Interval>,
    size_poll: Option<Interval>,
    last_pool_size: Option<usize>,
    /// Matcher holding our queue entry, if one may exist
    entry_matcher: Option<Arc<dyn PoolMatcher>>,
    relay_client: Option<RelayClient>,
}

impl Coordinator {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<MatchCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(MatchCommand::Join { interests, reply }) => {
                        let result = self.join(interests).await;
                        let _ = reply.send(result);
                    }
                    Some(MatchCommand::Leave { reply }) => {
                        self.leave().await;
                        let _ = reply.send(());
                    }
                    None => {
                        self.leave().await;
                        break;
                    }
                },

                _ = tick(&mut self.match_poll) => self.poll_match().await,

                _ = tick(&mut self.size_poll) => self.poll_pool_size().await,
            }
        }

        info!("Matchmaker for {} stopped", self.local.short());
    }

    fn emit(&self, event: MatchEvent) {
        let _ = self.events.send(event);
    }

    async fn join(&mut self, interests: Vec<String>) -> Result<JoinOutcome, JoinError> {
        self.leave().await;

        let (matcher, outcome) = self.attempt(&interests).await?;
        match outcome {
            MatchOutcome::Matched(found) => {
                self.entry_matcher = Some(matcher);
                info!(
                    "{} matched {} immediately (weight {})",
                    self.local.short(),
                    found.peer.short(),
                    found.weight
                );
                match self.pair_with(found.peer).await {
                    Ok(pairing) => Ok(JoinOutcome::Matched(pairing)),
                    Err(e) => {
                        self.leave().await;
                        Err(e.into())
                    }
                }
            }
            MatchOutcome::NoCandidate => {
                matcher.enqueue(&self.local, &interests).await?;
                self.entry_matcher = Some(matcher.clone());
                self.search = Some(Search { interests, matcher });
                self.match_poll = Some(poll_timer(self.config.match_poll_interval));
                self.size_poll = Some(poll_timer(self.config.pool_size_poll_interval));
                info!("{} is searching", self.local.short());
                self.emit(MatchEvent::Searching);
                Ok(JoinOutcome::Searching)
            }
        }
    }

    /// Primary first; the fallback only runs when the primary reports it is
    /// unavailable, never on an empty pool.
    async fn attempt(&self, interests: &[String]) -> Result<(Arc<dyn PoolMatcher>, MatchOutcome), MatchError> {
        match self.primary.attempt_match(&self.local, interests).await {
            Ok(outcome) => Ok((self.primary.clone(), outcome)),
            Err(MatchError::Unavailable(reason)) => {
                let Some(fallback) = &self.fallback else {
                    return Err(MatchError::Unavailable(reason));
                };
                warn!("Primary matcher unavailable ({}), using fallback", reason);
                let outcome = fallback.attempt_match(&self.local, interests).await?;
                Ok((fallback.clone(), outcome))
            }
            Err(e) => Err(e),
        }
    }

    async fn pair_with(&mut self, peer: ParticipantId) -> Result<Pairing, RelayError> {
        let client =
            RelayClient::attach(self.relay.clone(), self.config.pool_topic.clone(), self.local.clone()).await?;
        self.relay_client = Some(client.clone());
        Ok(Pairing::new(peer, client))
    }

    async fn poll_match(&mut self) {
        let Some(search) = &self.search else {
            return;
        };
        let matcher = search.matcher.clone();
        let interests = search.interests.clone();

        let peer = match self.find_peer(matcher.as_ref(), &interests).await {
            Ok(Some(peer)) => peer,
            Ok(None) => return,
            Err(MatchError::Unavailable(reason)) => {
                self.on_matcher_unavailable(reason).await;
                return;
            }
            Err(e) => {
                warn!("Match poll for {} failed: {}", self.local.short(), e);
                return;
            }
        };

        info!("{} matched {}", self.local.short(), peer.short());
        self.stop_polling();
        match self.pair_with(peer).await {
            Ok(pairing) => self.emit(MatchEvent::Matched(pairing)),
            Err(e) => {
                warn!("Could not subscribe to {}: {}", self.config.pool_topic, e);
                self.leave().await;
                self.emit(MatchEvent::Failed(e.to_string()));
            }
        }
    }

    /// A peer whose entry points back at us, or a fresh atomic match.
    async fn find_peer(
        &self,
        matcher: &dyn PoolMatcher,
        interests: &[String],
    ) -> Result<Option<ParticipantId>, MatchError> {
        if let Some(peer) = matcher.poll_matched_peer(&self.local).await? {
            if matcher.poll_matched_peer(&peer).await?.as_ref() == Some(&self.local) {
                return Ok(Some(peer));
            }
            info!(
                "{} was claimed by {} who has since left, searching again",
                self.local.short(),
                peer.short()
            );
            matcher.enqueue(&self.local, interests).await?;
        }

        // still searching: another searcher may have enqueued alongside us
        match matcher.attempt_match(&self.local, interests).await? {
            MatchOutcome::Matched(found) => Ok(Some(found.peer)),
            MatchOutcome::NoCandidate => Ok(None),
        }
    }

    /// Move a live search to the fallback matcher, or give up once no
    /// matcher is left.
    async fn on_matcher_unavailable(&mut self, reason: String) {
        let fallback = self.fallback.clone().filter(|fallback| {
            self.search
                .as_ref()
                .is_some_and(|search| !Arc::ptr_eq(&search.matcher, fallback))
        });

        if let (Some(fallback), Some(search)) = (fallback, &mut self.search) {
            warn!(
                "Matcher unavailable while {} was searching ({}), moving to fallback",
                self.local.short(),
                reason
            );
            match fallback.enqueue(&self.local, &search.interests).await {
                Ok(()) => {
                    search.matcher = fallback.clone();
                    self.entry_matcher = Some(fallback);
                    return;
                }
                Err(e) => warn!("Fallback enqueue for {} failed: {}", self.local.short(), e),
            }
        }

        warn!("No matcher available for {}, giving up", self.local.short());
        self.leave().await;
        self.emit(MatchEvent::Failed(format!("matcher unavailable: {}", reason)));
    }

    async fn poll_pool_size(&mut self) {
        let Some(search) = &self.search else {
            return;
        };
        let matcher = search.matcher.clone();
        match matcher.current_pool_size().await {
            Ok(searching) => {
                let others = searching.saturating_sub(1);
                if self.last_pool_size != Some(others) {
                    self.last_pool_size = Some(others);
                    self.emit(MatchEvent::PoolSize(others));
                }
            }
            Err(e) => debug!("Pool size poll failed: {}", e),
        }
    }

    fn stop_polling(&mut self) {
        self.search = None;
        self.match_poll = None;
        self.size_poll = None;
        self.last_pool_size = None;
    }

    /// Cancel timers, release the relay subscription and delete the queue
    /// entry. Each step runs even if an earlier one failed.
    async fn leave(&mut self) {
        self.stop_polling();

        if let Some(client) = self.relay_client.take() {
            client.close();
        }

        let active = self.entry_matcher.take().unwrap_or_else(|| self.primary.clone());
        if let Err(e) = active.remove_from_pool(&self.local).await {
            warn!("Failed to remove {} from pool: {}", self.local.short(), e);
            let others: Vec<_> = std::iter::once(self.primary.clone())
                .chain(self.fallback.clone())
                .filter(|m| !Arc::ptr_eq(m, &active))
                .collect();
            for other in others {
                if let Err(e) = other.remove_from_pool(&self.local).await {
                    warn!("Fallback removal of {} failed: {}", self.local.short(), e);
                }
            }
        }
    }
}

/// Handle to the matchmaking coordinator of one local participant.
///
/// Dropping the last handle leaves the pool.
#[derive(Clone)]
pub struct Matchmaker {
    local: ParticipantId,
    tx: mpsc::UnboundedSender<MatchCommand>,
}

impl Matchmaker {
    pub fn spawn(
        local: ParticipantId,
        primary: Arc<dyn PoolMatcher>,
        fallback: Option<Arc<dyn PoolMatcher>>,
        relay: Arc<dyn Relay>,
        config: MatchmakingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            local: local.clone(),
            primary,
            fallback,
            relay,
            config,
            events: event_tx,
            search: None,
            match_poll: None,
            size_poll: None,
            last_pool_size: None,
            entry_matcher: None,
            relay_client: None,
        };
        tokio::spawn(coordinator.run(rx));
        (Self { local, tx }, event_rx)
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Clear any previous search, then match immediately or start waiting.
    pub async fn join(&self, interests: &[String]) -> Result<JoinOutcome, JoinError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(MatchCommand::Join {
                interests: interests.to_vec(),
                reply,
            })
            .map_err(|_| JoinError::Stopped)?;
        reply_rx.await.map_err(|_| JoinError::Stopped)?
    }

    /// Stop searching and delete the queue entry. Safe to repeat.
    pub async fn leave(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self.tx.send(MatchCommand::Leave { reply }).is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub async fn skip(&self, interests: &[String]) -> Result<JoinOutcome, JoinError> {
        self.leave().await;
        self.join(interests).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use crate::relay::MemoryRelay;
    use crate::testing::SwitchableMatcher;
    use crate::types::Role;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        pool: MemoryPool,
        relay: Arc<dyn Relay>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pool: MemoryPool::spawn(),
                relay: Arc::new(MemoryRelay::new()),
            }
        }

        fn matchmaker(&self, local: &str) -> (Matchmaker, mpsc::UnboundedReceiver<MatchEvent>) {
            self.matchmaker_with(local, MatchmakingConfig::default())
        }

        fn matchmaker_with(
            &self,
            local: &str,
            config: MatchmakingConfig,
        ) -> (Matchmaker, mpsc::UnboundedReceiver<MatchEvent>) {
            Matchmaker::spawn(
                local.into(),
                Arc::new(self.pool.clone()),
                Some(Arc::new(self.pool.interest_agnostic())),
                self.relay.clone(),
                config,
            )
        }
    }

    async fn next_matched(events: &mut mpsc::UnboundedReceiver<MatchEvent>) -> Option<Pairing> {
        loop {
            match timeout(Duration::from_secs(30), events.recv()).await.ok().flatten()? {
                MatchEvent::Matched(pairing) => return Some(pairing),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_participant_learns_of_match_by_polling() {
        let fx = Fixture::new();
        let (b2, mut b2_events) = fx.matchmaker("b2");
        let (a1, _a1_events) = fx.matchmaker("a1");

        assert!(matches!(b2.join(&[]).await.unwrap(), JoinOutcome::Searching));
        assert!(matches!(b2_events.recv().await, Some(MatchEvent::Searching)));

        let JoinOutcome::Matched(a1_pairing) = a1.join(&[]).await.unwrap() else {
            panic!("a1 should match b2 immediately");
        };
        assert_eq!(a1_pairing.peer.as_str(), "b2");
        assert_eq!(a1_pairing.role, Role::Initiator);

        let started = Instant::now();
        let b2_pairing = next_matched(&mut b2_events).await.unwrap();
        assert_eq!(b2_pairing.peer.as_str(), "a1");
        assert_eq!(b2_pairing.role, Role::Responder);
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert_eq!(b2_pairing.topic(), a1_pairing.topic());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_pairs_participants_that_enqueued_together() {
        let fx = Fixture::new();
        let (b2, mut events) = fx.matchmaker("b2");
        b2.join(&[]).await.unwrap();

        // a second searcher entered without attempting a match
        fx.pool.enqueue(&"c3".into(), &[]).await.unwrap();

        let pairing = next_matched(&mut events).await.unwrap();
        assert_eq!(pairing.peer.as_str(), "c3");
        assert_eq!(fx.pool.poll_matched_peer(&"c3".into()).await.unwrap(), Some("b2".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_replaces_entry_and_timers() {
        let pool = MemoryPool::spawn();
        let matcher = Arc::new(SwitchableMatcher::new(pool.clone()));
        let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
        let (mm, _events) = Matchmaker::spawn(
            "a1".into(),
            matcher.clone(),
            None,
            relay,
            MatchmakingConfig::default(),
        );

        mm.join(&[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        mm.skip(&[]).await.unwrap();
        assert_eq!(matcher.attempts(), 2);
        assert_eq!(pool.current_pool_size().await.unwrap(), 1);

        // two ticks of a single match poll
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(matcher.attempts(), 4);
        assert_eq!(pool.current_pool_size().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_is_idempotent_and_stops_polling() {
        let pool = MemoryPool::spawn();
        let matcher = Arc::new(SwitchableMatcher::new(pool.clone()));
        let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
        let (mm, mut events) = Matchmaker::spawn(
            "a1".into(),
            matcher.clone(),
            None,
            relay,
            MatchmakingConfig::default(),
        );

        mm.join(&[]).await.unwrap();
        assert!(matches!(events.recv().await, Some(MatchEvent::Searching)));
        mm.leave().await;
        mm.leave().await;

        assert_eq!(pool.current_pool_size().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(matcher.attempts(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_matchers_insert_nothing() {
        let pool = MemoryPool::spawn();
        let primary = Arc::new(SwitchableMatcher::new(pool.clone()));
        let fallback = Arc::new(SwitchableMatcher::new(pool.interest_agnostic()));
        primary.set_available(false);
        fallback.set_available(false);
        let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
        let (mm, _events) = Matchmaker::spawn(
            "a1".into(),
            primary.clone(),
            Some(fallback.clone()),
            relay,
            MatchmakingConfig::default(),
        );

        let result = mm.join(&[]).await;
        assert!(matches!(result, Err(JoinError::Matcher(MatchError::Unavailable(_)))));
        assert_eq!(fallback.attempts(), 1);
        assert_eq!(pool.current_pool_size().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_only_runs_when_primary_is_unavailable() {
        let pool = MemoryPool::spawn();
        let primary = Arc::new(SwitchableMatcher::new(pool.clone()));
        let fallback = Arc::new(SwitchableMatcher::new(pool.interest_agnostic()));
        let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
        let (mm, _events) = Matchmaker::spawn(
            "a1".into(),
            primary.clone(),
            Some(fallback.clone()),
            relay,
            MatchmakingConfig::default(),
        );

        // empty pool is not an outage
        assert!(matches!(mm.join(&[]).await.unwrap(), JoinOutcome::Searching));
        assert_eq!(fallback.attempts(), 0);

        pool.enqueue(&"b2".into(), &[]).await.unwrap();
        primary.set_available(false);
        let JoinOutcome::Matched(pairing) = mm.skip(&[]).await.unwrap() else {
            panic!("fallback should have matched b2");
        };
        assert_eq!(pairing.peer.as_str(), "b2");
        assert_eq!(fallback.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_size_reported_only_on_change() {
        let fx = Fixture::new();
        let config = MatchmakingConfig {
            match_poll_interval: Duration::from_secs(600),
            ..MatchmakingConfig::default()
        };
        let (mm, mut events) = fx.matchmaker_with("a1", config);
        mm.join(&[]).await.unwrap();

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(7);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            seen.push(event);
        }
        assert!(matches!(seen.as_slice(), [MatchEvent::Searching, MatchEvent::PoolSize(0)]));

        fx.pool.enqueue(&"b2".into(), &[]).await.unwrap();
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert!(matches!(event, Some(MatchEvent::PoolSize(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn claimant_leaving_before_poll_returns_peer_to_search() {
        let fx = Fixture::new();
        let (b2, mut b2_events) = fx.matchmaker("b2");
        let (a1, _a1_events) = fx.matchmaker("a1");

        b2.join(&[]).await.unwrap();
        assert!(matches!(a1.join(&[]).await.unwrap(), JoinOutcome::Matched(_)));
        a1.leave().await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, b2_events.recv()).await {
            assert!(!matches!(event, MatchEvent::Matched(_) | MatchEvent::Failed(_)));
        }
        assert_eq!(fx.pool.poll_matched_peer(&"b2".into()).await.unwrap(), None);
        assert_eq!(fx.pool.current_pool_size().await.unwrap(), 1);

        let (c3, _c3_events) = fx.matchmaker("c3");
        let JoinOutcome::Matched(pairing) = c3.join(&[]).await.unwrap() else {
            panic!("b2 should be searching again");
        };
        assert_eq!(pairing.peer.as_str(), "b2");
        assert_eq!(next_matched(&mut b2_events).await.unwrap().peer.as_str(), "c3");
    }

    #[tokio::test(start_paused = true)]
    async fn search_moves_to_fallback_when_primary_goes_down() {
        let pool = MemoryPool::spawn();
        let primary = Arc::new(SwitchableMatcher::new(pool.clone()));
        let fallback = Arc::new(SwitchableMatcher::new(pool.interest_agnostic()));
        let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
        let (mm, mut events) = Matchmaker::spawn(
            "a1".into(),
            primary.clone(),
            Some(fallback.clone()),
            relay,
            MatchmakingConfig::default(),
        );

        assert!(matches!(mm.join(&[]).await.unwrap(), JoinOutcome::Searching));
        pool.enqueue(&"b2".into(), &[]).await.unwrap();
        primary.set_available(false);

        let pairing = next_matched(&mut events).await.unwrap();
        assert_eq!(pairing.peer.as_str(), "b2");
        assert_eq!(primary.attempts(), 1);
        assert!(fallback.attempts() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn search_fails_once_when_no_matcher_is_left() {
        let pool = MemoryPool::spawn();
        let primary = Arc::new(SwitchableMatcher::new(pool.clone()));
        let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
        let (mm, mut events) = Matchmaker::spawn(
            "a1".into(),
            primary.clone(),
            None,
            relay,
            MatchmakingConfig::default(),
        );

        mm.join(&[]).await.unwrap();
        primary.set_available(false);

        let mut failures = 0;
        let deadline = Instant::now() + Duration::from_secs(12);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            if matches!(event, MatchEvent::Failed(_)) {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
        assert_eq!(primary.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_leaves_pool() {
        let fx = Fixture::new();
        let (mm, _events) = fx.matchmaker("a1");
        mm.join(&[]).await.unwrap();
        assert_eq!(fx.pool.current_pool_size().await.unwrap(), 1);

        drop(mm);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.pool.current_pool_size().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_releases_pairing_subscription() {
        let fx = Fixture::new();
        fx.pool.enqueue(&"b2".into(), &[]).await.unwrap();
        let (mm, _events) = fx.matchmaker("a1");

        let JoinOutcome::Matched(pairing) = mm.join(&[]).await.unwrap() else {
            panic!("expected immediate match");
        };
        assert!(!pairing.is_stale());

        mm.leave().await;
        assert!(pairing.is_stale());
        assert_eq!(fx.pool.poll_matched_peer(&"a1".into()).await.unwrap(), None);
    }
}
