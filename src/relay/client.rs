use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{Relay, RelayError, Subscription};
use crate::signal::{SignalEnvelope, SignalKind};
use crate::types::{ParticipantId, Topic};

const INBOX_CAPACITY: usize = 256;

enum ClientCommand {
    SetHandler {
        generation: u64,
        tx: async_channel::Sender<SignalEnvelope>,
    },
    Detach {
        generation: u64,
    },
    Close,
}

/// Receiving end of the single active handler registration.
#[derive(Debug)]
pub struct Inbox {
    generation: u64,
    rx: async_channel::Receiver<SignalEnvelope>,
}

impl Inbox {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next envelope addressed to the local participant; `None` once the
    /// handler was replaced or the client closed.
    pub async fn recv(&self) -> Option<SignalEnvelope> {
        self.rx.recv().await.ok()
    }
}

struct Handler {
    generation: u64,
    tx: async_channel::Sender<SignalEnvelope>,
}

/// Pump between a topic subscription and the current handler. Envelopes that
/// arrive while no handler is registered wait in `pending` and are flushed,
/// in arrival order, to the next handler.
async fn relay_client_actor(
    local: ParticipantId,
    mut subscription: Subscription,
    mut rx: mpsc::UnboundedReceiver<ClientCommand>,
) {
    let mut pending: VecDeque<SignalEnvelope> = VecDeque::new();
    let mut handler: Option<Handler> = None;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(ClientCommand::SetHandler { generation, tx }) => {
                    if !pending.is_empty() {
                        debug!("Flushing {} buffered envelopes to handler {}", pending.len(), generation);
                    }
                    let mut next = Some(Handler { generation, tx });
                    while let Some(envelope) = pending.pop_front() {
                        if let Err(envelope) = deliver(&mut next, envelope).await {
                            pending.push_front(envelope);
                            break;
                        }
                    }
                    handler = next;
                }
                Some(ClientCommand::Detach { generation }) => {
                    if handler.as_ref().is_some_and(|h| h.generation == generation) {
                        debug!("Handler {} detached", generation);
                        handler = None;
                    }
                }
                Some(ClientCommand::Close) | None => break,
            },

            envelope = subscription.recv() => {
                let Some(envelope) = envelope else {
                    warn!("Relay subscription on {} ended", subscription.topic());
                    break;
                };
                if !envelope.is_addressed_to(&local) {
                    trace!("Ignoring envelope for {}", envelope.to.short());
                    continue;
                }
                if let Err(envelope) = deliver(&mut handler, envelope).await {
                    pending.push_back(envelope);
                }
            }
        }
    }

    info!("Relay client for {} on {} stopped", local.short(), subscription.topic());
}

/// Hand one envelope to the handler. A handler whose inbox was dropped is
/// unregistered and the envelope is given back for buffering.
async fn deliver(handler: &mut Option<Handler>, envelope: SignalEnvelope) -> Result<(), SignalEnvelope> {
    let Some(current) = handler.as_ref() else {
        return Err(envelope);
    };
    let sent = current.tx.send(envelope).await;
    match sent {
        Ok(()) => Ok(()),
        Err(async_channel::SendError(envelope)) => {
            debug!("Handler {} went away", current.generation);
            *handler = None;
            Err(envelope)
        }
    }
}

/// Signaling relay client for one local participant on one topic.
///
/// Cloning yields another handle to the same subscription.
#[derive(Clone)]
pub struct RelayClient {
    local: ParticipantId,
    topic: Topic,
    relay: Arc<dyn Relay>,
    tx: mpsc::UnboundedSender<ClientCommand>,
    generation: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayClient")
            .field("local", &self.local)
            .field("topic", &self.topic)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RelayClient {
    /// Subscribe to `topic` on behalf of `local`. Inbound envelopes are
    /// buffered from this point on, before any handler exists.
    pub async fn attach(relay: Arc<dyn Relay>, topic: Topic, local: ParticipantId) -> Result<Self, RelayError> {
        let subscription = relay.subscribe(&topic).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_client_actor(local.clone(), subscription, rx));

        info!("Relay client for {} attached to {}", local.short(), topic);
        Ok(Self {
            local,
            topic,
            relay,
            tx,
            generation: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Fire-and-forget publish of an envelope addressed to `to`.
    pub async fn publish(&self, to: &ParticipantId, kind: SignalKind, payload: Value) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let envelope = SignalEnvelope::new(self.local.clone(), to.clone(), kind, payload);
        self.relay.publish(&self.topic, envelope).await
    }

    /// Register the single active handler, replacing any previous one.
    /// Buffered envelopes go to this handler; envelopes already delivered to
    /// an earlier handler are not replayed.
    pub fn set_handler(&self) -> Inbox {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = async_channel::bounded(INBOX_CAPACITY);
        if self.tx.send(ClientCommand::SetHandler { generation, tx }).is_err() {
            debug!("Handler {} registered on a stopped relay client", generation);
        }
        Inbox { generation, rx }
    }

    /// Unregister the handler of `generation` if it is still the current one.
    pub fn detach(&self, generation: u64) {
        let _ = self.tx.send(ClientCommand::Detach { generation });
    }

    /// Release the subscription. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(ClientCommand::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
