use thiserror::Error;

use crate::session::SignalingState;

pub type MeshResult<T> = Result<T, MeshError>;

/// Caller misuse at the manager level.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(String),
    #[error("peer {0} is not registered")]
    UnknownPeer(String),
    #[error("signal addressed to {to} was routed to {local}")]
    Misaddressed { to: String, local: String },
    #[error("connection manager has been destroyed")]
    Destroyed,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Caller misuse at the link level.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot link peer {0} to itself")]
    SelfLink(String),
    #[error("signal addressed from {from} to {to} does not belong to link {local} <-> {peer}")]
    Misrouted {
        from: String,
        to: String,
        local: String,
        peer: String,
    },
    #[error("link has been destroyed")]
    Destroyed,
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("native session setup failed: {0}")]
    Setup(String),
    #[error("native session operation failed: {0}")]
    Operation(String),
    #[error("native session is closed")]
    Closed,
    #[error("control channel is closed")]
    ChannelClosed,
}

/// Signaling-state violations. Always recovered by resetting the link.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("received {kind} while signaling state is {state:?}")]
    UnexpectedSignal {
        kind: &'static str,
        state: SignalingState,
    },
    #[error("received ice candidate while signaling state is {state:?} without a remote description")]
    PrematureCandidate { state: SignalingState },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid signal payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("signal field `{0}` must not be empty")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is unreachable")]
    Unreachable,
    #[error("relay send failed: {0}")]
    Send(String),
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> SessionError {
    SessionError::Setup(err.to_string())
}

pub(crate) fn to_operation_error<E: std::fmt::Display>(err: E) -> SessionError {
    SessionError::Operation(err.to_string())
}
