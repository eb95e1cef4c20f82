//! Session transport driver: one negotiation per pairing, from `ready` to a
//! live transport or a terminal state.

mod driver;
mod state;
mod transport;

pub use driver::{Session, SessionError, SessionEvent};
pub use state::{ConnectionState, Negotiation};
pub use transport::{
    IceCandidate, PeerTransport, SdpKind, SessionDescription, TransportError, TransportEvent, TransportFactory,
    TransportHandle, TransportState,
};
