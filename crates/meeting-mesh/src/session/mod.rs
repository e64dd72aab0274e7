//! Abstraction over the platform peer connection a link drives.
//!
//! A [`SessionFactory`] hands out one [`NativeSession`] per link generation
//! together with the stream of events it raises. Two backends exist: the
//! `webrtc` crate and a deterministic in-memory session used by tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;

pub mod memory;
pub mod webrtc_backend;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Browser-compatible `{type, sdp}` description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Browser-compatible ICE candidate init.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
    Unknown,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Unknown,
        }
    }
}

pub fn local_track_kind(track: &LocalTrack) -> TrackKind {
    track.kind().into()
}

/// Identifies a sender for the lifetime of the session that reported it.
pub type SenderId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub id: SenderId,
    pub track_id: Option<String>,
    pub kind: TrackKind,
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_ids: Vec<String>,
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_ids", &self.stream_ids)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl CandidateKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "host" => CandidateKind::Host,
            "srflx" => CandidateKind::ServerReflexive,
            "prflx" => CandidateKind::PeerReflexive,
            "relay" => CandidateKind::Relay,
            _ => CandidateKind::Unknown,
        }
    }
}

/// One statistics pull. Byte counters are `None` when the session reports no
/// RTP streams in that direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub timestamp_ms: u64,
    pub bytes_received: Option<u64>,
    pub bytes_sent: Option<u64>,
    pub active_pair: Option<(CandidateKind, CandidateKind)>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    NegotiationNeeded,
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<IceCandidate>),
    SignalingState(SignalingState),
    ConnectionState(ConnectionState),
    IceConnectionState(IceConnectionState),
    Track(RemoteTrack),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Error(String),
    Closing,
    Closed,
}

#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Queues a text frame; delivery failures surface as [`ChannelEvent::Error`].
    fn send_text(&self, text: String) -> Result<(), SessionError>;
    async fn close(&self);
}

pub struct ControlChannelHandle {
    pub channel: Arc<dyn ControlChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
pub trait NativeSession: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    /// Creates and applies the description the current state calls for: an
    /// offer when stable, an answer when a remote offer is pending.
    async fn set_local_description(&self) -> Result<SessionDescription, SessionError>;

    /// Applies a remote description, rolling back a pending local offer first
    /// when an offer arrives in `have-local-offer`.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), SessionError>;

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>)
        -> Result<(), SessionError>;

    async fn create_control_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<ControlChannelHandle, SessionError>;

    async fn senders(&self) -> Vec<SenderInfo>;

    async fn add_track(&self, track: LocalTrack) -> Result<(), SessionError>;

    async fn replace_track(&self, sender: SenderId, track: LocalTrack) -> Result<(), SessionError>;

    async fn remove_sender(&self, sender: SenderId) -> Result<(), SessionError>;

    async fn stats(&self) -> Result<TransportStats, SessionError>;

    async fn close(&self);
}

pub struct SessionHandle {
    pub session: Arc<dyn NativeSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Allocates a fresh native session. Must be called from within a Tokio runtime.
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Result<SessionHandle, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_json_matches_browser_shape() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);

        let parsed: Option<IceCandidate> = serde_json::from_str("null").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn description_uses_type_field() {
        let text = r#"{"type":"answer","sdp":"v=0"}"#;
        let description: SessionDescription = serde_json::from_str(text).unwrap();
        assert_eq!(description.kind, SdpKind::Answer);
        assert_eq!(serde_json::to_string(&description).unwrap(), text);
    }

    #[test]
    fn candidate_kinds_parse() {
        assert_eq!(CandidateKind::parse("relay"), CandidateKind::Relay);
        assert_eq!(CandidateKind::parse("srflx"), CandidateKind::ServerReflexive);
        assert_eq!(CandidateKind::parse("bogus"), CandidateKind::Unknown);
    }
}
