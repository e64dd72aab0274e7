pub mod config;
pub mod error;
pub mod link;
pub mod manager;
pub mod protocol;
pub mod session;

pub use config::{IceConfig, IceServer, LinkConfig, MeshConfig, TurnCredentials};
pub use error::{
    LinkError, MeshError, MeshResult, NegotiationError, ProtocolError, RelayError, SessionError,
};
pub use link::bitrate::Bitrates;
pub use link::handshake::HandshakeState;
pub use link::{LinkEvent, LinkSnapshot, PeerLink, SignalSink};
pub use manager::{ConnectionManager, MeshEvent, SignalRelay};
pub use protocol::{OutboundSignal, SignalBody, SignalMessage};
pub use session::memory::MemorySessionFactory;
pub use session::webrtc_backend::WebRtcSessionFactory;
