use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("negotiation step failed: {0}")]
    Negotiation(String),

    #[error("data channel is not open")]
    ChannelClosed,

    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Local or remote session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the browser-compatible JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Connectivity state as reported by the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from the transport, delivered in order on one channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A discovered local candidate; `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    StateChanged(TransportState),
    DataChannelOpen,
    Message(Bytes),
    RemoteTrack { kind: String },
}

/// The real-time transport primitive one session drives.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create the application data channel (initiator side).
    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError>;

    /// Accept the data channel the initiator presents (responder side).
    async fn accept_data_channel(&self) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Re-check connectivity in place without renegotiating.
    async fn restart_ice(&self) -> Result<(), TransportError>;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Release the transport and any local media it holds.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A freshly constructed transport plus its event stream. Events are
/// buffered from construction on, so candidates discovered before the
/// driver starts reading are not lost.
pub struct TransportHandle {
    pub transport: Box<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<TransportHandle, TransportError>;
}
