//! Host-facing facade: one local participant, at most one live session.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, DirectBridge};
use crate::config::{Config, SessionConfig};
use crate::matchmaker::{JoinError, JoinOutcome, MatchEvent, Matchmaker};
use crate::notify::Notifier;
use crate::pairing::Pairing;
use crate::pool::PoolMatcher;
use crate::relay::Relay;
use crate::session::{Session, SessionError, SessionEvent, TransportFactory};
use crate::types::{ParticipantId, Role};

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("no active session")]
    NoSession,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Searching,
    PoolSize(usize),
    Paired { peer: ParticipantId, role: Role },
    Session(SessionEvent),
    /// The current session's driver finished
    SessionEnded,
    MatchFailed(String),
}

/// External collaborators a conversation runs against
pub struct Collaborators {
    pub matcher: Arc<dyn PoolMatcher>,
    pub fallback: Option<Arc<dyn PoolMatcher>>,
    pub relay: Arc<dyn Relay>,
    pub transports: Arc<dyn TransportFactory>,
    pub notifier: Arc<dyn Notifier>,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct Conversation {
    local: ParticipantId,
    matchmaker: Matchmaker,
    match_events: mpsc::UnboundedReceiver<MatchEvent>,
    bridge: DirectBridge,
    transports: Arc<dyn TransportFactory>,
    notifier: Arc<dyn Notifier>,
    session_config: SessionConfig,
    interests: Vec<String>,
    session: Option<Session>,
    session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    pending: VecDeque<ConversationEvent>,
}

impl Conversation {
    pub fn new(local: ParticipantId, collaborators: Collaborators, config: &Config) -> Self {
        let Collaborators {
            matcher,
            fallback,
            relay,
            transports,
            notifier,
        } = collaborators;
        let (matchmaker, match_events) = Matchmaker::spawn(
            local.clone(),
            matcher,
            fallback,
            relay.clone(),
            config.matchmaking.clone(),
        );

        Self {
            local,
            matchmaker,
            match_events,
            bridge: DirectBridge::new(relay, &config.bridge),
            transports,
            notifier,
            session_config: config.session.clone(),
            interests: Vec::new(),
            session: None,
            session_events: None,
            pending: VecDeque::new(),
        }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn peer(&self) -> Option<&ParticipantId> {
        self.session.as_ref().map(Session::peer)
    }

    /// Enter matchmaking with the given interests, ending any current session.
    pub async fn join(&mut self, interests: &[String]) -> Result<(), ConversationError> {
        self.close_session().await;
        self.interests = interests.to_vec();
        let outcome = self.matchmaker.join(&self.interests).await?;
        self.handle_join(outcome).await
    }

    /// Drop the current peer or search and look for someone else.
    pub async fn skip(&mut self) -> Result<(), ConversationError> {
        self.close_session().await;
        let outcome = self.matchmaker.skip(&self.interests).await?;
        self.handle_join(outcome).await
    }

    /// Leave matchmaking and close the session, if any.
    pub async fn end(&mut self) {
        self.close_session().await;
        self.matchmaker.leave().await;
        info!("{} ended the conversation", self.local.short());
    }

    /// Talk to a peer agreed on out of band, bypassing the pool.
    pub async fn connect_direct(&mut self, peer: ParticipantId) -> Result<(), ConversationError> {
        self.close_session().await;
        let pairing = self
            .bridge
            .connect(self.local.clone(), peer, Some(&self.matchmaker))
            .await?;
        self.start_session(pairing).await
    }

    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), ConversationError> {
        let session = self.session.as_ref().ok_or(ConversationError::NoSession)?;
        session.send(data).await?;
        Ok(())
    }

    /// Next event for the host. Pool matches reported here start their
    /// session before `Paired` is returned. `None` once the matchmaker is gone.
    pub async fn next_event(&mut self) -> Option<ConversationEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            tokio::select! {
                event = self.match_events.recv() => match event? {
                    MatchEvent::Searching => return Some(ConversationEvent::Searching),
                    MatchEvent::PoolSize(others) => return Some(ConversationEvent::PoolSize(others)),
                    MatchEvent::Failed(reason) => return Some(ConversationEvent::MatchFailed(reason)),
                    MatchEvent::Matched(pairing) => {
                        if pairing.is_stale() {
                            debug!("Discarding superseded match with {}", pairing.peer.short());
                            continue;
                        }
                        if let Err(e) = self.start_session(pairing).await {
                            return Some(ConversationEvent::MatchFailed(e.to_string()));
                        }
                    }
                },

                event = recv_opt(&mut self.session_events) => match event {
                    Some(event) => return Some(ConversationEvent::Session(event)),
                    None => {
                        self.session_events = None;
                        self.session = None;
                        return Some(ConversationEvent::SessionEnded);
                    }
                },
            }
        }
    }

    async fn handle_join(&mut self, outcome: JoinOutcome) -> Result<(), ConversationError> {
        match outcome {
            JoinOutcome::Matched(pairing) => self.start_session(pairing).await,
            JoinOutcome::Searching => Ok(()),
        }
    }

    async fn start_session(&mut self, pairing: Pairing) -> Result<(), ConversationError> {
        self.close_session().await;

        let peer = pairing.peer.clone();
        let role = pairing.role;
        let started = Session::start(
            pairing,
            self.transports.as_ref(),
            self.notifier.clone(),
            self.session_config.clone(),
        )
        .await;

        match started {
            Ok((session, events)) => {
                self.session = Some(session);
                self.session_events = Some(events);
                self.pending.push_back(ConversationEvent::Paired { peer, role });
                Ok(())
            }
            Err(e) => {
                warn!("Session with {} could not start: {}", peer.short(), e);
                self.matchmaker.leave().await;
                Err(e.into())
            }
        }
    }

    async fn close_session(&mut self) {
        self.session_events = None;
        if let Some(session) = self.session.take() {
            debug!("Closing session with {}", session.peer().short());
            session.close().await;
        }
    }
}
