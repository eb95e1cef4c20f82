use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::state::{ConnectionState, Negotiation};
use super::transport::{
    IceCandidate, PeerTransport, SessionDescription, TransportError, TransportEvent, TransportFactory,
    TransportHandle, TransportState,
};
use crate::config::SessionConfig;
use crate::notify::{Notifier, Severity};
use crate::pairing::Pairing;
use crate::relay::{Inbox, RelayClient};
use crate::signal::{SignalEnvelope, SignalKind};
use crate::types::{ParticipantId, Role};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session setup failed: {0}")]
    Setup(#[source] TransportError),

    #[error("data channel is not open")]
    ChannelNotReady,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session has ended")]
    Ended,
}

/// What a session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    State(ConnectionState),
    DataChannelOpen,
    Message(Bytes),
    RemoteTrack { kind: String },
}

enum SessionCommand {
    Send {
        data: Bytes,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Close,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns one negotiation: the transport, the relay handler registration and
/// every timer. Runs until the connection state is terminal.
struct Driver {
    local: ParticipantId,
    negotiation: Negotiation,
    transport: Box<dyn PeerTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport_events_open: bool,
    relay: RelayClient,
    inbox: Inbox,
    inbox_open: bool,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    notifier: Arc<dyn Notifier>,
    config: SessionConfig,
    negotiation_deadline: Option<Instant>,
    recovery_deadline: Option<Instant>,
    offer_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        info!(
            "Session {} <-> {} started as {}",
            self.local.short(),
            self.negotiation.peer.short(),
            self.negotiation.role
        );
        self.negotiation_deadline = Some(Instant::now() + self.config.negotiation_timeout);
        self.publish(SignalKind::Ready, &Value::Null).await;
        self.negotiation.ready_sent = true;
        self.schedule_offer();

        while !self.negotiation.state().is_terminal() {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Send { data, reply }) => {
                        let result = self.send(data).await;
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Close) | None => self.close().await,
                },

                envelope = self.inbox.recv(), if self.inbox_open => match envelope {
                    Some(envelope) => self.on_envelope(envelope).await,
                    None => {
                        debug!("Signaling inbox for {} closed", self.local.short());
                        self.inbox_open = false;
                    }
                },

                event = self.transport_events.recv(), if self.transport_events_open => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        debug!("Transport event stream ended");
                        self.transport_events_open = false;
                    }
                },

                _ = sleep_until_opt(self.negotiation_deadline) => {
                    self.negotiation_deadline = None;
                    self.fail("negotiation timed out").await;
                }

                _ = sleep_until_opt(self.recovery_deadline) => {
                    self.recovery_deadline = None;
                    self.fail("connection lost").await;
                }

                _ = sleep_until_opt(self.offer_at) => {
                    self.offer_at = None;
                    self.send_offer().await;
                }
            }
        }

        self.relay.detach(self.inbox.generation());
        info!(
            "Session {} <-> {} ended ({})",
            self.local.short(),
            self.negotiation.peer.short(),
            self.negotiation.state()
        );
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&mut self, next: ConnectionState) {
        let previous = self.negotiation.state();
        if self.negotiation.advance(next) {
            debug!("Session with {}: {} -> {}", self.negotiation.peer.short(), previous, next);
            self.emit(SessionEvent::State(next));
        }
    }

    /// Best-effort: a lost signal surfaces later as a negotiation timeout.
    async fn publish<T: Serialize + Sync>(&self, kind: SignalKind, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode {:?} payload: {}", kind, e);
                return;
            }
        };
        if let Err(e) = self.relay.publish(&self.negotiation.peer, kind, payload).await {
            warn!("Failed to publish {:?} to {}: {}", kind, self.negotiation.peer.short(), e);
        }
    }

    fn schedule_offer(&mut self) {
        if self.negotiation.should_create_offer() && self.offer_at.is_none() {
            debug!("Offer to {} scheduled", self.negotiation.peer.short());
            self.offer_at = Some(Instant::now() + self.config.offer_delay);
        }
    }

    async fn send_offer(&mut self) {
        if !self.negotiation.should_create_offer() {
            return;
        }
        match self.create_offer().await {
            Ok(offer) => {
                self.negotiation.offer_sent = true;
                self.publish(SignalKind::Offer, &offer).await;
                info!("Offer sent to {}", self.negotiation.peer.short());
            }
            Err(e) => self.fail(&format!("failed to create offer: {}", e)).await,
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn on_envelope(&mut self, envelope: SignalEnvelope) {
        if envelope.from != self.negotiation.peer {
            debug!("Dropping {:?} from {}, not our peer", envelope.kind, envelope.from.short());
            return;
        }

        match envelope.kind {
            SignalKind::Ready => {
                if !self.negotiation.peer_ready {
                    self.negotiation.peer_ready = true;
                    debug!("Peer {} is ready", self.negotiation.peer.short());
                    // our first ready may predate the peer's subscription
                    self.publish(SignalKind::Ready, &Value::Null).await;
                }
                self.schedule_offer();
            }
            SignalKind::Offer => self.on_offer(&envelope).await,
            SignalKind::Answer => self.on_answer(&envelope).await,
            SignalKind::IceCandidate => {
                let Some(candidate) = envelope.candidate() else {
                    debug!("Malformed candidate from {} dropped", envelope.from.short());
                    return;
                };
                match self.negotiation.accept_candidate(candidate) {
                    Some(candidate) => self.apply_candidate(candidate).await,
                    None => debug!("Candidate queued ({} pending)", self.negotiation.pending_candidates()),
                }
            }
        }
    }

    async fn on_offer(&mut self, envelope: &SignalEnvelope) {
        if self.negotiation.role.is_initiator() {
            debug!("Ignoring offer while initiating");
            return;
        }
        if self.negotiation.remote_description_set {
            debug!("Duplicate offer ignored");
            return;
        }
        let Some(offer) = envelope.description() else {
            debug!("Malformed offer dropped");
            return;
        };
        if let Err(e) = self.answer_offer(offer).await {
            self.fail(&format!("failed to answer offer: {}", e)).await;
        }
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), TransportError> {
        self.transport.set_remote_description(offer).await?;
        self.drain_candidates().await;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.publish(SignalKind::Answer, &answer).await;
        self.negotiation.answer_sent = true;
        info!("Answer sent to {}", self.negotiation.peer.short());
        Ok(())
    }

    async fn on_answer(&mut self, envelope: &SignalEnvelope) {
        if !self.negotiation.role.is_initiator() || !self.negotiation.offer_sent {
            debug!("Unexpected answer ignored");
            return;
        }
        if self.negotiation.remote_description_set {
            debug!("Duplicate answer ignored");
            return;
        }
        let Some(answer) = envelope.description() else {
            debug!("Malformed answer dropped");
            return;
        };
        match self.transport.set_remote_description(answer).await {
            Ok(()) => self.drain_candidates().await,
            Err(e) => self.fail(&format!("failed to apply answer: {}", e)).await,
        }
    }

    async fn drain_candidates(&mut self) {
        for candidate in self.negotiation.remote_description_applied() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!("Failed to add remote candidate: {}", e);
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(Some(candidate)) => {
                self.publish(SignalKind::IceCandidate, &candidate).await;
            }
            TransportEvent::LocalCandidate(None) => debug!("Local candidate gathering complete"),
            TransportEvent::StateChanged(state) => self.on_transport_state(state).await,
            TransportEvent::DataChannelOpen => {
                self.negotiation.data_channel_ready = true;
                info!("Data channel with {} open", self.negotiation.peer.short());
                self.emit(SessionEvent::DataChannelOpen);
            }
            TransportEvent::Message(data) => self.emit(SessionEvent::Message(data)),
            TransportEvent::RemoteTrack { kind } => {
                debug!("Remote {} track from {}", kind, self.negotiation.peer.short());
                self.emit(SessionEvent::RemoteTrack { kind });
            }
        }
    }

    async fn on_transport_state(&mut self, state: TransportState) {
        match state {
            TransportState::New => {}
            TransportState::Connecting => self.transition(ConnectionState::Connecting),
            TransportState::Connected => {
                self.negotiation_deadline = None;
                if self.recovery_deadline.take().is_some() {
                    info!("Connection to {} recovered", self.negotiation.peer.short());
                }
                self.transition(ConnectionState::Connected);
            }
            TransportState::Disconnected => {
                if self.negotiation.state() != ConnectionState::Connected {
                    debug!("Disconnect before connecting ignored");
                    return;
                }
                self.transition(ConnectionState::Disconnected);
                self.recovery_deadline = Some(Instant::now() + self.config.recovery_window);
                if let Err(e) = self.transport.restart_ice().await {
                    warn!("Connectivity restart failed: {}", e);
                }
            }
            TransportState::Failed => self.fail("transport failed").await,
            TransportState::Closed => {
                if !self.negotiation.state().is_terminal() {
                    self.cancel_timers();
                    self.transition(ConnectionState::Closed);
                }
            }
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        if !self.negotiation.data_channel_ready {
            return Err(SessionError::ChannelNotReady);
        }
        self.transport.send(data).await?;
        Ok(())
    }

    fn cancel_timers(&mut self) {
        self.negotiation_deadline = None;
        self.recovery_deadline = None;
        self.offer_at = None;
    }

    async fn release_transport(&self) {
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close transport: {}", e);
        }
    }

    /// Enter `failed` at most once; a session already torn down stays quiet.
    async fn fail(&mut self, reason: &str) {
        if self.negotiation.state().is_terminal() {
            return;
        }
        warn!("Session with {} failed: {}", self.negotiation.peer.short(), reason);
        self.cancel_timers();
        self.transition(ConnectionState::Failed);
        self.release_transport().await;
        self.notifier.notify(&format!("Connection failed: {}", reason), Severity::Error);
    }

    async fn close(&mut self) {
        if self.negotiation.state().is_terminal() {
            return;
        }
        self.cancel_timers();
        self.release_transport().await;
        self.transition(ConnectionState::Closed);
    }
}

/// Handle to a running session driver.
///
/// Dropping the handle tears the session down like [`Session::close`],
/// without waiting for it.
#[derive(Debug)]
pub struct Session {
    peer: ParticipantId,
    role: Role,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl Session {
    /// Build the transport and prepare the data channel, then take over the
    /// pairing's relay handler and start negotiating. Nothing is registered
    /// on the relay client if setup fails.
    pub async fn start(
        pairing: Pairing,
        factory: &dyn TransportFactory,
        notifier: Arc<dyn Notifier>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let TransportHandle {
            transport,
            events: transport_events,
        } = factory.create().await.map_err(SessionError::Setup)?;

        let prepared = if pairing.role.is_initiator() {
            transport.create_data_channel(&config.data_channel_label).await
        } else {
            transport.accept_data_channel().await
        };
        if let Err(e) = prepared {
            if let Err(close_err) = transport.close().await {
                warn!("Failed to close transport after setup error: {}", close_err);
            }
            return Err(SessionError::Setup(e));
        }

        let Pairing {
            local,
            peer,
            role,
            relay,
        } = pairing;
        let inbox = relay.set_handler();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            local,
            negotiation: Negotiation::new(peer.clone(), role),
            transport,
            transport_events,
            transport_events_open: true,
            relay,
            inbox,
            inbox_open: true,
            commands: command_rx,
            events: event_tx,
            notifier,
            config,
            negotiation_deadline: None,
            recovery_deadline: None,
            offer_at: None,
        };
        let task = tokio::spawn(driver.run());

        Ok((
            Self {
                peer,
                role,
                commands: command_tx,
                task,
            },
            event_rx,
        ))
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Send application data over the data channel.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Send {
                data: data.into(),
                reply,
            })
            .map_err(|_| SessionError::Ended)?;
        reply_rx.await.map_err(|_| SessionError::Ended)?
    }

    /// Tear down and wait until the transport and relay handler are released.
    pub async fn close(self) {
        let _ = self.commands.send(SessionCommand::Close);
        if let Err(e) = self.task.await {
            warn!("Session task ended abnormally: {}", e);
        }
    }
}
