//! Deterministic in-process session. Descriptions are opaque strings and the
//! signaling state machine follows the browser rules closely enough to drive
//! perfect negotiation between two links without a network.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{
    local_track_kind, ChannelEvent, ControlChannel, ControlChannelHandle, IceCandidate,
    LocalTrack, NativeSession, SdpKind, SenderId, SenderInfo, SessionDescription, SessionEvent,
    SessionFactory, SessionHandle, SignalingState, TransportStats,
};
use crate::error::SessionError;

#[derive(Default)]
pub struct MemorySessionFactory {
    sessions: Mutex<Vec<Arc<MemorySession>>>,
}

impl MemorySessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sessions(&self) -> Vec<Arc<MemorySession>> {
        self.sessions.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MemorySession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl SessionFactory for MemorySessionFactory {
    fn create(&self) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.sessions.lock();
        let (events_tx, events) = mpsc::unbounded_channel();
        let session = Arc::new(MemorySession {
            serial: sessions.len() as u64,
            events_tx,
            state: Mutex::new(MemoryState::default()),
            gate: Notify::new(),
        });
        sessions.push(Arc::clone(&session));
        Ok(SessionHandle {
            session,
            events,
        })
    }
}

struct MemoryState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<Option<IceCandidate>>,
    senders: Vec<(SenderId, Option<LocalTrack>)>,
    next_sender: SenderId,
    descriptions_created: u64,
    stats: TransportStats,
    control: Option<Arc<MemoryControlChannel>>,
    negotiation_pending: bool,
    hold_remote: bool,
    reject_local: bool,
    closed: bool,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            candidates: Vec::new(),
            senders: Vec::new(),
            next_sender: 1,
            descriptions_created: 0,
            stats: TransportStats::default(),
            control: None,
            negotiation_pending: false,
            hold_remote: false,
            reject_local: false,
            closed: false,
        }
    }
}

pub struct MemorySession {
    serial: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<MemoryState>,
    gate: Notify,
}

impl MemorySession {
    /// Position of this session in its factory's allocation order.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Raises an event as if the platform produced it.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_stats(&self, stats: TransportStats) {
        self.state.lock().stats = stats;
    }

    pub fn control_channel(&self) -> Option<Arc<MemoryControlChannel>> {
        self.state.lock().control.clone()
    }

    pub fn candidates(&self) -> Vec<Option<IceCandidate>> {
        self.state.lock().candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .senders
            .iter()
            .filter_map(|(_, track)| track.as_ref().map(|track| track.id().to_string()))
            .collect()
    }

    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Parks every `set_remote_description` call until
    /// [`release_remote_descriptions`](Self::release_remote_descriptions).
    pub fn hold_remote_descriptions(&self) {
        self.state.lock().hold_remote = true;
    }

    pub fn release_remote_descriptions(&self) {
        self.state.lock().hold_remote = false;
        self.gate.notify_waiters();
    }

    /// Makes `set_local_description` fail until switched off again.
    pub fn reject_local_descriptions(&self, reject: bool) {
        self.state.lock().reject_local = reject;
    }

    async fn pass_gate(&self) {
        loop {
            let released = self.gate.notified();
            if !self.state.lock().hold_remote {
                return;
            }
            released.await;
        }
    }

    /// Records an unnegotiated change. The event waits for `Stable`.
    fn negotiation_needed(&self, state: &mut MemoryState) {
        state.negotiation_pending = true;
        if state.signaling == SignalingState::Stable {
            self.emit(SessionEvent::NegotiationNeeded);
        }
    }

    fn transition(&self, state: &mut MemoryState, next: SignalingState) {
        if state.signaling == next {
            return;
        }
        state.signaling = next;
        self.emit(SessionEvent::SignalingState(next));
        if next == SignalingState::Stable && state.negotiation_pending {
            self.emit(SessionEvent::NegotiationNeeded);
        }
    }

    fn ensure_open(state: &MemoryState) -> Result<(), SessionError> {
        if state.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NativeSession for MemorySession {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn set_local_description(&self) -> Result<SessionDescription, SessionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.reject_local {
            return Err(SessionError::Operation("local description rejected".into()));
        }
        let (kind, next) = match state.signaling {
            SignalingState::Stable => (SdpKind::Offer, SignalingState::HaveLocalOffer),
            SignalingState::HaveRemoteOffer => (SdpKind::Answer, SignalingState::Stable),
            other => {
                return Err(SessionError::Operation(format!(
                    "cannot create a local description in {other:?}"
                )))
            }
        };
        if kind == SdpKind::Offer {
            state.negotiation_pending = false;
        }
        state.descriptions_created += 1;
        let description = SessionDescription {
            kind,
            sdp: format!(
                "memory-{:?}-{}-{}",
                kind, self.serial, state.descriptions_created
            ),
        };
        state.local = Some(description.clone());
        self.transition(&mut state, next);
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.pass_gate().await;
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let next = match (description.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Offer, SignalingState::HaveLocalOffer) => {
                state.local = None;
                SignalingState::HaveRemoteOffer
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(SessionError::Operation(format!(
                    "cannot apply remote {kind:?} in {current:?}"
                )))
            }
        };
        state.remote = Some(description);
        self.transition(&mut state, next);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.remote.is_none() {
            return Err(SessionError::Operation(
                "remote description is not set".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn create_control_channel(
        &self,
        label: &str,
        _id: u16,
    ) -> Result<ControlChannelHandle, SessionError> {
        let (channel, events) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            let (channel, events) = MemoryControlChannel::new(label);
            state.control = Some(Arc::clone(&channel));
            self.negotiation_needed(&mut state);
            (channel, events)
        };
        Ok(ControlChannelHandle {
            channel,
            events,
        })
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|(id, track)| SenderInfo {
                id: *id,
                track_id: track.as_ref().map(|track| track.id().to_string()),
                kind: track
                    .as_ref()
                    .map(local_track_kind)
                    .unwrap_or(super::TrackKind::Unknown),
            })
            .collect()
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let id = state.next_sender;
        state.next_sender += 1;
        state.senders.push((id, Some(track)));
        self.negotiation_needed(&mut state);
        Ok(())
    }

    async fn replace_track(&self, sender: SenderId, track: LocalTrack) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        match state.senders.iter_mut().find(|(id, _)| *id == sender) {
            Some((_, slot)) => {
                *slot = Some(track);
                Ok(())
            }
            None => Err(SessionError::Operation(format!("unknown sender {sender}"))),
        }
    }

    async fn remove_sender(&self, sender: SenderId) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        match state.senders.iter_mut().find(|(id, _)| *id == sender) {
            Some((_, slot)) => *slot = None,
            None => return Err(SessionError::Operation(format!("unknown sender {sender}"))),
        }
        self.negotiation_needed(&mut state);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, SessionError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(state.stats.clone())
    }

    async fn close(&self) {
        let control = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.control.take()
        };
        if let Some(control) = control {
            control.close().await;
        }
    }
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    closed: bool,
    sent: Vec<String>,
    peer: Option<Weak<MemoryControlChannel>>,
}

pub struct MemoryControlChannel {
    label: String,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    state: Mutex<ChannelState>,
}

impl MemoryControlChannel {
    fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.to_string(),
            events_tx,
            state: Mutex::new(ChannelState::default()),
        });
        (channel, events)
    }

    /// Cross-wires two channels so each one's sends arrive at the other.
    pub fn pair(a: &Arc<MemoryControlChannel>, b: &Arc<MemoryControlChannel>) {
        a.state.lock().peer = Some(Arc::downgrade(b));
        b.state.lock().peer = Some(Arc::downgrade(a));
    }

    pub fn open(&self) {
        {
            let mut state = self.state.lock();
            if state.open || state.closed {
                return;
            }
            state.open = true;
        }
        let _ = self.events_tx.send(ChannelEvent::Open);
    }

    pub fn deliver(&self, text: impl Into<String>) {
        let _ = self.events_tx.send(ChannelEvent::Message(text.into()));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.events_tx.send(ChannelEvent::Error(reason.into()));
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().sent)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl ControlChannel for MemoryControlChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.open && !state.closed
    }

    fn send_text(&self, text: String) -> Result<(), SessionError> {
        let peer = {
            let mut state = self.state.lock();
            if !state.open || state.closed {
                return Err(SessionError::ChannelClosed);
            }
            state.sent.push(text.clone());
            state.peer.as_ref().and_then(Weak::upgrade)
        };
        if let Some(peer) = peer {
            peer.deliver(text);
        }
        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
        }
        let _ = self.events_tx.send(ChannelEvent::Closed);
    }
}
