//! Native sessions backed by the `webrtc` crate.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, OnceCell};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;

use super::{
    CandidateKind, ChannelEvent, ConnectionState, ControlChannel, ControlChannelHandle,
    IceCandidate, IceConnectionState, LocalTrack, NativeSession, RemoteTrack, SdpKind, SenderId,
    SenderInfo, SessionDescription, SessionEvent, SessionFactory, SessionHandle, SignalingState,
    TransportStats,
};
use crate::config::IceConfig;
use crate::error::{to_operation_error, to_setup_error, SessionError};

fn build_api(setting: SettingEngine) -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// STUN URIs may not carry a query, so `?transport=` hints are stripped and
/// the resulting duplicates collapsed.
fn normalize_urls(urls: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(urls.len());
    for url in urls {
        let url = if url.starts_with("stun:") || url.starts_with("stuns:") {
            url.split('?').next().unwrap_or(url).to_string()
        } else {
            url.clone()
        };
        if !normalized.contains(&url) {
            normalized.push(url);
        }
    }
    normalized
}

fn rtc_configuration(ice: &IceConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice
            .servers
            .iter()
            .map(|server| RTCIceServer {
                urls: normalize_urls(&server.urls),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_candidate_pool_size: ice.candidate_pool_size,
        ..Default::default()
    }
}

pub struct WebRtcSessionFactory {
    api: Arc<API>,
    ice: IceConfig,
}

impl WebRtcSessionFactory {
    pub fn new(ice: IceConfig) -> Result<Self, SessionError> {
        Self::with_setting_engine(ice, SettingEngine::default())
    }

    pub fn with_setting_engine(ice: IceConfig, setting: SettingEngine) -> Result<Self, SessionError> {
        Ok(Self {
            api: Arc::new(build_api(setting)?),
            ice,
        })
    }
}

impl SessionFactory for WebRtcSessionFactory {
    fn create(&self) -> Result<SessionHandle, SessionError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let session = Arc::new(WebRtcSession {
            api: Arc::clone(&self.api),
            configuration: rtc_configuration(&self.ice),
            events_tx,
            pc: OnceCell::new(),
        });
        // Allocation is async; start it now so gathering begins early and
        // later calls only wait on the same cell.
        let warmup = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(err) = warmup.peer_connection().await {
                tracing::warn!(target = "webrtc", error = %err, "peer connection allocation failed");
            }
        });
        Ok(SessionHandle { session, events })
    }
}

pub struct WebRtcSession {
    api: Arc<API>,
    configuration: RTCConfiguration,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    pc: OnceCell<Arc<RTCPeerConnection>>,
}

impl WebRtcSession {
    async fn peer_connection(&self) -> Result<&Arc<RTCPeerConnection>, SessionError> {
        self.pc
            .get_or_try_init(|| async {
                let pc = self
                    .api
                    .new_peer_connection(self.configuration.clone())
                    .await
                    .map_err(to_setup_error)?;
                let pc = Arc::new(pc);
                register_handlers(&pc, &self.events_tx);
                Ok::<_, SessionError>(pc)
            })
            .await
    }

    async fn find_sender(&self, sender: SenderId) -> Result<Arc<RTCRtpSender>, SessionError> {
        let pc = self.peer_connection().await?;
        pc.get_senders()
            .await
            .into_iter()
            .find(|candidate| sender_id(candidate) == sender)
            .ok_or_else(|| SessionError::Operation(format!("unknown sender {sender}")))
    }
}

fn sender_id(sender: &Arc<RTCRtpSender>) -> SenderId {
    Arc::as_ptr(sender) as SenderId
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events_tx: &mpsc::UnboundedSender<SessionEvent>) {
    let tx = events_tx.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::NegotiationNeeded);
        })
    }));

    let tx = events_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(json) => Some(IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    }),
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                        return;
                    }
                },
                None => None,
            };
            let _ = tx.send(SessionEvent::IceCandidate(candidate));
        })
    }));

    let tx = events_tx.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::SignalingState(state.into()));
        })
    }));

    let tx = events_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::ConnectionState(state.into()));
        })
    }));

    let tx = events_tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::IceConnectionState(state.into()));
        })
    }));

    let tx = events_tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let remote = RemoteTrack {
                id: track.id().to_string(),
                kind: track.kind().into(),
                stream_ids: vec![track.stream_id().to_string()],
                track: Some(track),
            };
            let _ = tx.send(SessionEvent::Track(remote));
        })
    }));
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, SessionError> {
    serde_json::to_value(description)
        .and_then(serde_json::from_value)
        .map_err(to_operation_error)
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription, SessionError> {
    serde_json::to_value(description)
        .and_then(serde_json::from_value)
        .map_err(to_operation_error)
}

#[async_trait]
impl NativeSession for WebRtcSession {
    fn signaling_state(&self) -> SignalingState {
        self.pc
            .get()
            .map(|pc| pc.signaling_state().into())
            .unwrap_or(SignalingState::Stable)
    }

    async fn has_remote_description(&self) -> bool {
        match self.peer_connection().await {
            Ok(pc) => pc.remote_description().await.is_some(),
            Err(_) => false,
        }
    }

    async fn set_local_description(&self) -> Result<SessionDescription, SessionError> {
        let pc = self.peer_connection().await?;
        let description = match pc.signaling_state() {
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                pc.create_answer(None).await.map_err(to_operation_error)?
            }
            _ => pc.create_offer(None).await.map_err(to_operation_error)?,
        };
        pc.set_local_description(description)
            .await
            .map_err(to_operation_error)?;
        let applied = pc
            .local_description()
            .await
            .ok_or_else(|| SessionError::Operation("missing local description".into()))?;
        from_rtc_description(&applied)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        let pc = self.peer_connection().await?;
        if description.kind == SdpKind::Offer
            && pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            // Rollback needs a parseable body; the pending offer serves.
            let pending = pc
                .pending_local_description()
                .await
                .ok_or_else(|| SessionError::Operation("no pending local offer".into()))?;
            let rollback = to_rtc_description(&SessionDescription {
                kind: SdpKind::Rollback,
                sdp: pending.sdp,
            })?;
            pc.set_local_description(rollback)
                .await
                .map_err(to_operation_error)?;
        }
        let description = to_rtc_description(&description)?;
        pc.set_remote_description(description)
            .await
            .map_err(to_operation_error)
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), SessionError> {
        let Some(candidate) = candidate else {
            return Ok(());
        };
        let pc = self.peer_connection().await?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        pc.add_ice_candidate(init).await.map_err(to_operation_error)
    }

    async fn create_control_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<ControlChannelHandle, SessionError> {
        let pc = self.peer_connection().await?;
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(id),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        let (events_tx, events) = mpsc::unbounded_channel();
        let channel = WebRtcControlChannel::new(label, dc, events_tx);
        Ok(ControlChannelHandle {
            channel,
            events,
        })
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        let Ok(pc) = self.peer_connection().await else {
            return Vec::new();
        };
        let mut infos = Vec::new();
        for sender in pc.get_senders().await {
            let track = sender.track().await;
            infos.push(SenderInfo {
                id: sender_id(&sender),
                track_id: track.as_ref().map(|track| track.id().to_string()),
                kind: track
                    .as_ref()
                    .map(|track| track.kind().into())
                    .unwrap_or(super::TrackKind::Unknown),
            });
        }
        infos
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), SessionError> {
        let pc = self.peer_connection().await?;
        pc.add_track(track).await.map_err(to_operation_error)?;
        Ok(())
    }

    async fn replace_track(&self, sender: SenderId, track: LocalTrack) -> Result<(), SessionError> {
        let sender = self.find_sender(sender).await?;
        sender
            .replace_track(Some(track))
            .await
            .map_err(to_operation_error)
    }

    async fn remove_sender(&self, sender: SenderId) -> Result<(), SessionError> {
        let rtp_sender = self.find_sender(sender).await?;
        let pc = self.peer_connection().await?;
        pc.remove_track(&rtp_sender)
            .await
            .map_err(to_operation_error)
    }

    async fn stats(&self) -> Result<TransportStats, SessionError> {
        let pc = self.peer_connection().await?;
        let report = pc.get_stats().await;

        let mut bytes_received: Option<u64> = None;
        let mut bytes_sent: Option<u64> = None;
        let mut nominated: Option<(String, String)> = None;
        let mut candidate_kinds = std::collections::HashMap::new();

        for (id, entry) in report.reports.iter() {
            match entry {
                StatsReportType::InboundRTP(stats) => {
                    *bytes_received.get_or_insert(0) += stats.bytes_received;
                }
                StatsReportType::OutboundRTP(stats) => {
                    *bytes_sent.get_or_insert(0) += stats.bytes_sent;
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    nominated = Some((
                        pair.local_candidate_id.clone(),
                        pair.remote_candidate_id.clone(),
                    ));
                }
                StatsReportType::LocalCandidate(candidate)
                | StatsReportType::RemoteCandidate(candidate) => {
                    candidate_kinds.insert(
                        id.clone(),
                        CandidateKind::parse(&candidate.candidate_type.to_string()),
                    );
                }
                _ => {}
            }
        }

        let active_pair = nominated.map(|(local, remote)| {
            let kind_of = |id: &String| {
                candidate_kinds
                    .get(id)
                    .copied()
                    .unwrap_or(CandidateKind::Unknown)
            };
            (kind_of(&local), kind_of(&remote))
        });

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();

        Ok(TransportStats {
            timestamp_ms,
            bytes_received,
            bytes_sent,
            active_pair,
        })
    }

    async fn close(&self) {
        if let Some(pc) = self.pc.get() {
            if let Err(err) = pc.close().await {
                tracing::debug!(target = "webrtc", error = %err, "peer connection close failed");
            }
        }
    }
}

struct WebRtcControlChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    outbound_tx: mpsc::UnboundedSender<String>,
}

impl WebRtcControlChannel {
    fn new(
        label: &str,
        dc: Arc<RTCDataChannel>,
        events_tx: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Arc<Self> {
        let tx = events_tx.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", "control channel opened");
                let _ = tx.send(ChannelEvent::Open);
            })
        }));

        let tx = events_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(ChannelEvent::Message(text));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "dropping non-utf8 control frame");
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        dc.on_error(Box::new(move |err| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Error(err.to_string()));
            })
        }));

        let tx = events_tx.clone();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Closed);
            })
        }));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let writer_dc = Arc::clone(&dc);
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = writer_dc.send_text(text).await {
                    tracing::warn!(target = "webrtc", error = %err, "control channel send failed");
                    let _ = events_tx.send(ChannelEvent::Error(err.to_string()));
                    break;
                }
            }
        });

        Arc::new(Self {
            label: label.to_string(),
            dc,
            outbound_tx,
        })
    }
}

#[async_trait]
impl ControlChannel for WebRtcControlChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.outbound_tx
            .send(text)
            .map_err(|_| SessionError::ChannelClosed)
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "control channel close failed");
        }
    }
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
            _ => IceConnectionState::New,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IceServer, TurnCredentials};

    #[test]
    fn stun_queries_are_stripped() {
        let urls = normalize_urls(&[
            "stun:stun.l.google.com:19302?transport=udp".to_string(),
            "stun:stun.l.google.com:19302?transport=tcp".to_string(),
            "turn:turn.example.com:3478?transport=tcp".to_string(),
        ]);
        assert_eq!(
            urls,
            vec![
                "stun:stun.l.google.com:19302".to_string(),
                "turn:turn.example.com:3478?transport=tcp".to_string(),
            ]
        );
    }

    #[test]
    fn turn_configuration_carries_credentials() {
        let ice = IceConfig::from_turn(
            &["turn:turn.example.com:3478".to_string()],
            Some(&TurnCredentials {
                username: "u".into(),
                password: "p".into(),
            }),
        );
        let config = rtc_configuration(&ice);
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.ice_servers[0].username, "u");
        assert_eq!(config.ice_servers[0].credential, "p");

        let bare = rtc_configuration(&IceConfig {
            servers: vec![IceServer {
                urls: vec!["stun:example.org".into()],
                username: None,
                credential: None,
            }],
            candidate_pool_size: 0,
        });
        assert!(bare.ice_servers[0].username.is_empty());
    }

    #[tokio::test]
    async fn offer_is_produced_after_control_channel_creation() {
        let factory = WebRtcSessionFactory::new(IceConfig::local_only()).unwrap();
        let handle = factory.create().unwrap();
        let control = handle
            .session
            .create_control_channel("control", 0)
            .await
            .unwrap();
        assert_eq!(control.channel.label(), "control");
        assert!(!control.channel.is_open());

        let offer = handle.session.set_local_description().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(!offer.sdp.is_empty());
        assert_eq!(handle.session.signaling_state(), SignalingState::HaveLocalOffer);
        handle.session.close().await;
    }
}
