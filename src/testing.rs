//! Scripted collaborators shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::notify::{Notifier, Severity};
use crate::pool::{MatchError, MatchOutcome, MemoryPool, PoolMatcher};
use crate::session::{
    IceCandidate, PeerTransport, SdpKind, SessionDescription, TransportError, TransportEvent, TransportFactory,
    TransportHandle, TransportState,
};
use crate::types::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreateDataChannel(String),
    AcceptDataChannel,
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    RestartIce,
    Send(Bytes),
    Close,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MockBehavior {
    pub fail_data_channel: bool,
    pub fail_offer: bool,
}

pub(crate) struct MockTransport {
    name: String,
    calls: Arc<Mutex<Vec<Call>>>,
    behavior: MockBehavior,
}

impl MockTransport {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        self.record(Call::CreateDataChannel(label.to_string()));
        if self.behavior.fail_data_channel {
            return Err(TransportError::Unavailable("no data channels".to_string()));
        }
        Ok(())
    }

    async fn accept_data_channel(&self) -> Result<(), TransportError> {
        self.record(Call::AcceptDataChannel);
        if self.behavior.fail_data_channel {
            return Err(TransportError::Unavailable("no data channels".to_string()));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateOffer);
        if self.behavior.fail_offer {
            return Err(TransportError::Negotiation("offer rejected".to_string()));
        }
        Ok(SessionDescription::offer(format!("offer-from-{}", self.name)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer-from-{}", self.name)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetLocal(description.kind));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetRemote(description.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        self.record(Call::RestartIce);
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.record(Call::Send(data));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close);
        Ok(())
    }
}

/// Test-side view of a mock transport: recorded calls and an event injector.
#[derive(Clone)]
pub(crate) struct MockControl {
    calls: Arc<Mutex<Vec<Call>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockControl {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, call: &Call) -> bool {
        self.calls().contains(call)
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn state(&self, state: TransportState) {
        self.emit(TransportEvent::StateChanged(state));
    }
}

/// Hands out one prepared mock transport, then reports unavailability.
pub(crate) struct MockFactory {
    slot: Mutex<Option<TransportHandle>>,
}

impl MockFactory {
    pub fn new(name: &str) -> (Self, MockControl) {
        Self::with_behavior(name, MockBehavior::default())
    }

    pub fn with_behavior(name: &str, behavior: MockBehavior) -> (Self, MockControl) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = MockTransport {
            name: name.to_string(),
            calls: calls.clone(),
            behavior,
        };
        let handle = TransportHandle {
            transport: Box::new(transport),
            events: rx,
        };
        let factory = Self {
            slot: Mutex::new(Some(handle)),
        };
        (factory, MockControl { calls, events: tx })
    }

    pub fn exhausted() -> Self {
        Self { slot: Mutex::new(None) }
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(&self) -> Result<TransportHandle, TransportError> {
        self.slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Unavailable("no transport left".to_string()))
    }
}

/// Builds a fresh mock per `create` call and keeps every control handle.
#[derive(Default)]
pub(crate) struct MockFleet {
    controls: Mutex<Vec<MockControl>>,
}

impl MockFleet {
    pub fn controls(&self) -> Vec<MockControl> {
        self.controls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for MockFleet {
    async fn create(&self) -> Result<TransportHandle, TransportError> {
        let (factory, control) = MockFactory::new("fleet");
        self.controls.lock().unwrap().push(control);
        factory.create().await
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    messages: Mutex<Vec<(String, Severity)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, Severity)> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        self.messages.lock().unwrap().push((message.to_string(), severity));
    }
}

/// Matcher over a shared [`MemoryPool`] that can be switched off, and that
/// counts match attempts.
pub(crate) struct SwitchableMatcher {
    inner: MemoryPool,
    available: AtomicBool,
    attempts: AtomicUsize,
}

impl SwitchableMatcher {
    pub fn new(inner: MemoryPool) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), MatchError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MatchError::Unavailable("switched off".to_string()))
        }
    }
}

#[async_trait]
impl PoolMatcher for SwitchableMatcher {
    async fn attempt_match(
        &self,
        participant: &ParticipantId,
        interests: &[String],
    ) -> Result<MatchOutcome, MatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.attempt_match(participant, interests).await
    }

    async fn enqueue(&self, participant: &ParticipantId, interests: &[String]) -> Result<(), MatchError> {
        self.check()?;
        self.inner.enqueue(participant, interests).await
    }

    async fn poll_matched_peer(&self, participant: &ParticipantId) -> Result<Option<ParticipantId>, MatchError> {
        self.check()?;
        self.inner.poll_matched_peer(participant).await
    }

    async fn current_pool_size(&self) -> Result<usize, MatchError> {
        self.check()?;
        self.inner.current_pool_size().await
    }

    async fn remove_from_pool(&self, participant: &ParticipantId) -> Result<(), MatchError> {
        self.check()?;
        self.inner.remove_from_pool(participant).await
    }
}
