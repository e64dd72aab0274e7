//! One [`PeerLink`] per remote participant.
//!
//! A link owns a native session and drives it through the token handshake,
//! perfect negotiation and the control-channel takeover. Every native session
//! allocation bumps the link's generation; asynchronous work captures the
//! generation it started under and goes quiet once it no longer matches.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::protocol::{
    generate_token, ContentKind, HandshakeSignal, OutboundSignal, SignalBody, SignalMessage,
};
use crate::session::{
    CandidateKind, ConnectionState, ControlChannel, LocalTrack, NativeSession, RemoteTrack,
    SessionEvent, SessionFactory, SessionHandle, SignalingState,
};

pub mod bitrate;
mod control;
pub mod handshake;
mod negotiation;
pub mod tracks;

use bitrate::{BitrateWindow, Bitrates};
use handshake::{on_handshake, HandshakeAction, HandshakeState};

pub use negotiation::{decide_answer, decide_candidate, decide_offer};

/// Relay path used while a link has no open control channel.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, signal: OutboundSignal);
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Track(RemoteTrack),
    ConnectionState(ConnectionState),
    SignalingState(SignalingState),
    Disconnected,
    Bitrates(Bitrates),
}

/// Point-in-time view of a link, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub generation: u64,
    pub token: String,
    pub handshake: HandshakeState,
    pub pristine: bool,
    pub connecting: bool,
    pub control_operational: bool,
    pub outgoing_counter: u64,
    pub incoming_counter: u64,
    pub peer_session_version: Option<u64>,
    pub using_relay: bool,
    pub input_tracks: usize,
}

pub(crate) enum Outgoing {
    Handshake(HandshakeSignal),
    Content(ContentKind, String),
}

enum Job {
    Negotiate,
    Content { kind: ContentKind, content: String },
    SyncTracks(Vec<LocalTrack>),
}

struct LinkState {
    generation: u64,
    token: String,
    handshake: HandshakeState,
    pristine: bool,
    connecting: bool,
    control_operational: bool,
    outgoing_counter: u64,
    incoming_counter: u64,
    peer_session_version: Option<u64>,
    negotiation_queued: bool,
    session: Option<Arc<dyn NativeSession>>,
    control: Option<Arc<dyn ControlChannel>>,
    control_requested: bool,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    input_tracks: Vec<LocalTrack>,
    incoming: BitrateWindow,
    outgoing: BitrateWindow,
    using_relay: bool,
    last_inbound: Instant,
    heartbeat: Option<JoinHandle<()>>,
    telemetry: Option<JoinHandle<()>>,
    session_tasks: Vec<JoinHandle<()>>,
    destroyed: bool,
}

impl LinkState {
    fn new(config: &LinkConfig) -> Self {
        Self {
            generation: 0,
            token: generate_token(),
            handshake: HandshakeState::New,
            pristine: false,
            connecting: false,
            control_operational: false,
            outgoing_counter: 0,
            incoming_counter: 0,
            peer_session_version: None,
            negotiation_queued: false,
            session: None,
            control: None,
            control_requested: false,
            jobs: None,
            input_tracks: Vec::new(),
            incoming: BitrateWindow::new(config.bitrate_window_ms),
            outgoing: BitrateWindow::new(config.bitrate_window_ms),
            using_relay: false,
            last_inbound: Instant::now(),
            heartbeat: None,
            telemetry: None,
            session_tasks: Vec::new(),
            destroyed: false,
        }
    }

    fn abort_session_tasks(&mut self) {
        for task in self.session_tasks.drain(..) {
            task.abort();
        }
        self.jobs = None;
    }
}

pub(crate) struct LinkInner {
    peer_id: String,
    local_id: String,
    polite: bool,
    config: LinkConfig,
    factory: Arc<dyn SessionFactory>,
    relay: Arc<dyn SignalSink>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<LinkState>,
}

/// Handle to a link. Dropping it tears the link down.
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl PeerLink {
    /// Creates a link and allocates its first native session. Must be called
    /// from within a Tokio runtime.
    pub fn new(
        local_id: impl Into<String>,
        peer_id: impl Into<String>,
        config: LinkConfig,
        factory: Arc<dyn SessionFactory>,
        relay: Arc<dyn SignalSink>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, LinkError> {
        let local_id = local_id.into();
        let peer_id = peer_id.into();
        if local_id == peer_id {
            return Err(LinkError::SelfLink(peer_id));
        }
        let inner = Arc::new(LinkInner {
            polite: handshake::is_polite(&local_id, &peer_id),
            state: Mutex::new(LinkState::new(&config)),
            peer_id,
            local_id,
            config,
            factory,
            relay,
            events,
        });
        {
            let mut st = inner.state.lock();
            inner.install_session(&mut st)?;
            if inner.config.report_bitrates {
                st.telemetry = Some(inner.start_telemetry());
            }
        }
        tracing::debug!(
            target = "mesh",
            peer = %inner.peer_id,
            polite = inner.polite,
            "peer link created"
        );
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn is_polite(&self) -> bool {
        self.inner.polite
    }

    /// Starts the handshake. No-op while already connecting.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Drops back to an idle fresh session without retrying.
    pub fn pause(&self) {
        self.inner.reset("paused");
    }

    /// Forces a full session reset.
    pub fn reset(&self, reason: &str) {
        self.inner.reset(reason);
    }

    pub fn handle_signal(&self, message: SignalMessage) -> Result<(), LinkError> {
        self.inner.handle_signal(message)
    }

    pub fn set_input_tracks(&self, tracks: Vec<LocalTrack>) {
        self.inner.set_input_tracks(tracks);
    }

    pub fn control_operational(&self) -> bool {
        self.inner.state.lock().control_operational
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.inner.state.lock().handshake
    }

    pub fn token(&self) -> String {
        self.inner.state.lock().token.clone()
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        let st = self.inner.state.lock();
        LinkSnapshot {
            generation: st.generation,
            token: st.token.clone(),
            handshake: st.handshake,
            pristine: st.pristine,
            connecting: st.connecting,
            control_operational: st.control_operational,
            outgoing_counter: st.outgoing_counter,
            incoming_counter: st.incoming_counter,
            peer_session_version: st.peer_session_version,
            using_relay: st.using_relay,
            input_tracks: st.input_tracks.len(),
        }
    }

    /// Releases the native session and cancels all pending work.
    pub fn destroy(&self) {
        self.inner.shutdown();
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl LinkInner {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn is_current(&self, generation: u64) -> bool {
        let st = self.state.lock();
        !st.destroyed && st.generation == generation
    }

    fn install_session(self: &Arc<Self>, st: &mut LinkState) -> Result<(), LinkError> {
        let SessionHandle { session, events } = self.factory.create()?;
        st.generation += 1;
        let generation = st.generation;
        st.session = Some(session);
        st.control_requested = false;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        st.jobs = Some(jobs_tx);
        st.session_tasks
            .push(tokio::spawn(Arc::clone(self).pump_session_events(generation, events)));
        st.session_tasks
            .push(tokio::spawn(Arc::clone(self).run_jobs(generation, jobs_rx)));
        st.pristine = true;
        Ok(())
    }

    fn reset(self: &Arc<Self>, reason: &str) {
        let released = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            tracing::info!(
                target = "mesh",
                peer = %self.peer_id,
                generation = st.generation,
                pristine = st.pristine,
                reason,
                "resetting peer link"
            );
            st.token = generate_token();
            st.handshake = HandshakeState::New;
            st.outgoing_counter = 0;
            st.incoming_counter = 0;
            st.control_operational = false;
            st.connecting = false;
            st.negotiation_queued = false;
            st.using_relay = false;
            st.incoming.clear();
            st.outgoing.clear();
            if let Some(heartbeat) = st.heartbeat.take() {
                heartbeat.abort();
            }
            if st.pristine {
                None
            } else {
                st.abort_session_tasks();
                let session = st.session.take();
                let control = st.control.take();
                if let Err(err) = self.install_session(&mut st) {
                    tracing::error!(
                        target = "mesh",
                        peer = %self.peer_id,
                        error = %err,
                        "failed to allocate fresh session"
                    );
                }
                Some((session, control))
            }
        };

        if let Some((session, control)) = released {
            if session.is_some() {
                self.emit(LinkEvent::Disconnected);
            }
            release_native(session, control);
        }
    }

    /// Resets after a failure and asks the peer for a new session right away.
    /// A relay that is down turns the request back into a pause.
    pub(crate) fn restart(self: &Arc<Self>, reason: &str) {
        self.reset(reason);
        self.connect();
    }

    fn shutdown(&self) {
        let (session, control) = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.connecting = false;
            if let Some(heartbeat) = st.heartbeat.take() {
                heartbeat.abort();
            }
            if let Some(telemetry) = st.telemetry.take() {
                telemetry.abort();
            }
            st.abort_session_tasks();
            (st.session.take(), st.control.take())
        };
        tracing::debug!(target = "mesh", peer = %self.peer_id, "peer link destroyed");
        release_native(session, control);
    }

    fn connect(self: &Arc<Self>) {
        let generation = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            if st.connecting {
                tracing::debug!(target = "mesh", peer = %self.peer_id, "already connecting");
                return;
            }
            st.connecting = true;
            st.handshake = HandshakeState::Requesting;
            self.ensure_heartbeat(&mut st);
            st.generation
        };
        tracing::debug!(target = "mesh", peer = %self.peer_id, "requesting session");
        self.send_signal(generation, Outgoing::Handshake(HandshakeSignal::Requesting));
    }

    fn handle_signal(self: &Arc<Self>, message: SignalMessage) -> Result<(), LinkError> {
        if message.from != self.peer_id || message.to != self.local_id {
            return Err(LinkError::Misrouted {
                from: message.from,
                to: message.to,
                local: self.local_id.clone(),
                peer: self.peer_id.clone(),
            });
        }
        {
            let mut st = self.state.lock();
            if st.destroyed {
                return Err(LinkError::Destroyed);
            }
            st.last_inbound = Instant::now();
        }
        self.observe_version(message.version);

        if let Some(signal) = message.body.as_handshake() {
            self.on_handshake(signal, &message.token);
        } else if let Some((kind, content, counter)) = message.body.as_content() {
            self.on_content(kind, content, counter, &message.token);
        }
        Ok(())
    }

    fn observe_version(self: &Arc<Self>, version: u64) {
        let restart = {
            let mut st = self.state.lock();
            match st.peer_session_version {
                None => {
                    st.peer_session_version = Some(version);
                    false
                }
                Some(known) if version > known => {
                    st.peer_session_version = Some(version);
                    !st.control_operational
                }
                Some(_) => false,
            }
        };
        if restart {
            self.reset("remote peer restarted its relay session");
        }
    }

    fn on_handshake(self: &Arc<Self>, signal: HandshakeSignal, token: &str) {
        let action = {
            let mut st = self.state.lock();
            st.connecting = true;
            on_handshake(st.handshake, self.polite, &st.token, signal, token)
        };
        tracing::trace!(
            target = "mesh",
            peer = %self.peer_id,
            signal = ?signal,
            action = ?action,
            "handshake message"
        );

        match action {
            HandshakeAction::Ignore => {}
            HandshakeAction::Accept => {
                self.reset("accepting peer handshake");
                let generation = {
                    let mut st = self.state.lock();
                    if st.destroyed {
                        return;
                    }
                    st.token = token.to_string();
                    st.handshake = HandshakeState::Acknowledging;
                    st.connecting = true;
                    self.ensure_heartbeat(&mut st);
                    st.generation
                };
                self.send_signal(generation, Outgoing::Handshake(HandshakeSignal::Acknowledging));
            }
            HandshakeAction::Synchronize => {
                let generation = {
                    let mut st = self.state.lock();
                    st.handshake = HandshakeState::Synchronized;
                    self.ensure_heartbeat(&mut st);
                    st.generation
                };
                tracing::info!(target = "mesh", peer = %self.peer_id, "handshake synchronized");
                self.send_signal(generation, Outgoing::Handshake(HandshakeSignal::Synchronized));
                self.open_control_channel();
            }
        }
    }

    fn on_content(self: &Arc<Self>, kind: ContentKind, content: &str, counter: u64, token: &str) {
        let confirmed = {
            let mut st = self.state.lock();
            if st.token != token {
                tracing::debug!(
                    target = "mesh",
                    peer = %self.peer_id,
                    kind = kind.as_str(),
                    "dropping content with stale token"
                );
                return;
            }
            let confirmed = st.handshake == HandshakeState::Acknowledging;
            if confirmed {
                st.handshake = HandshakeState::Synchronized;
            }
            if counter != st.incoming_counter {
                tracing::warn!(
                    target = "mesh",
                    peer = %self.peer_id,
                    expected = st.incoming_counter,
                    received = counter,
                    "content counter mismatch"
                );
            }
            st.incoming_counter += 1;
            st.pristine = false;
            if let Some(jobs) = &st.jobs {
                let _ = jobs.send(Job::Content {
                    kind,
                    content: content.to_string(),
                });
            }
            confirmed
        };
        if confirmed {
            tracing::info!(target = "mesh", peer = %self.peer_id, "handshake confirmed by content");
            self.open_control_channel();
        }
    }

    fn request_negotiation(&self, generation: u64) {
        let mut st = self.state.lock();
        if st.destroyed || st.generation != generation || st.negotiation_queued {
            return;
        }
        st.negotiation_queued = true;
        st.pristine = false;
        if let Some(jobs) = &st.jobs {
            let _ = jobs.send(Job::Negotiate);
        }
    }

    fn set_input_tracks(self: &Arc<Self>, tracks: Vec<LocalTrack>) {
        let apply = {
            let mut st = self.state.lock();
            st.input_tracks = tracks;
            st.control_operational.then_some(st.generation)
        };
        match apply {
            Some(generation) => self.apply_input_tracks(generation),
            None => tracing::debug!(
                target = "mesh",
                peer = %self.peer_id,
                "caching input tracks until control channel is operational"
            ),
        }
    }

    fn apply_input_tracks(&self, generation: u64) {
        let mut st = self.state.lock();
        if st.destroyed || st.generation != generation {
            return;
        }
        st.incoming.clear();
        st.outgoing.clear();
        if !st.connecting {
            return;
        }
        let tracks = st.input_tracks.clone();
        if let Some(jobs) = &st.jobs {
            let _ = jobs.send(Job::SyncTracks(tracks));
        }
    }

    pub(crate) fn send_signal(self: &Arc<Self>, generation: u64, outgoing: Outgoing) {
        enum Route {
            Control(Arc<dyn ControlChannel>, String),
            Relay(OutboundSignal),
        }

        let route = {
            let mut st = self.state.lock();
            if st.destroyed || st.generation != generation {
                tracing::info!(
                    target = "mesh",
                    peer = %self.peer_id,
                    generation,
                    "suppressing outbound signal from stale session"
                );
                return;
            }
            let body = match outgoing {
                Outgoing::Handshake(signal) => SignalBody::handshake(signal),
                Outgoing::Content(kind, content) => {
                    let counter = st.outgoing_counter;
                    st.outgoing_counter += 1;
                    SignalBody::content(kind, content, counter)
                }
            };
            let signal = OutboundSignal {
                to: self.peer_id.clone(),
                from: self.local_id.clone(),
                token: st.token.clone(),
                body,
            };
            match &st.control {
                Some(channel) if channel.is_open() => {
                    let version = st.peer_session_version.unwrap_or_default();
                    match signal.clone().with_version(version).to_json() {
                        Ok(text) => Route::Control(Arc::clone(channel), text),
                        Err(err) => {
                            tracing::warn!(target = "mesh", error = %err, "failed to encode control message");
                            Route::Relay(signal)
                        }
                    }
                }
                _ => Route::Relay(signal),
            }
        };

        match route {
            Route::Control(channel, text) => {
                if let Err(err) = channel.send_text(text) {
                    tracing::warn!(
                        target = "mesh",
                        peer = %self.peer_id,
                        error = %err,
                        "control channel send failed"
                    );
                    self.control_failed(generation, &channel, "send failed");
                }
            }
            Route::Relay(signal) => self.relay.send_signal(signal),
        }
    }

    fn ensure_heartbeat(self: &Arc<Self>, st: &mut LinkState) {
        if st
            .heartbeat
            .as_ref()
            .is_some_and(|heartbeat| !heartbeat.is_finished())
        {
            return;
        }
        let link = Arc::clone(self);
        let period = self.config.heartbeat_interval();
        st.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !link.heartbeat_tick().await {
                    break;
                }
            }
        }));
    }

    async fn heartbeat_tick(self: &Arc<Self>) -> bool {
        let (generation, signal, probe, expired) = {
            let st = self.state.lock();
            if st.destroyed {
                return false;
            }
            let Some(signal) = st.handshake.heartbeat() else {
                return false;
            };
            let expired = st.control_operational
                && st.last_inbound.elapsed() > self.config.liveness_timeout();
            let probe = match &st.control {
                Some(channel) if channel.is_open() => st.session.clone(),
                _ => None,
            };
            (st.generation, signal, probe, expired)
        };
        if expired {
            tracing::warn!(target = "mesh", peer = %self.peer_id, "heartbeat liveness expired");
            self.restart("heartbeat timeout");
            return false;
        }
        self.send_signal(generation, Outgoing::Handshake(signal));
        if let Some(session) = probe {
            self.classify_path(generation, session).await;
        }
        true
    }

    async fn classify_path(&self, generation: u64, session: Arc<dyn NativeSession>) {
        let Ok(stats) = session.stats().await else {
            return;
        };
        let relayed = stats.active_pair.is_some_and(|(local, remote)| {
            local == CandidateKind::Relay || remote == CandidateKind::Relay
        });
        let mut st = self.state.lock();
        if st.destroyed || st.generation != generation || st.using_relay == relayed {
            return;
        }
        st.using_relay = relayed;
        tracing::debug!(target = "mesh", peer = %self.peer_id, relayed, "connection path classified");
    }

    fn start_telemetry(self: &Arc<Self>) -> JoinHandle<()> {
        let link = Arc::clone(self);
        let period = self.config.bitrate_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                link.sample_bitrates().await;
            }
        })
    }

    async fn sample_bitrates(&self) {
        let (generation, session) = {
            let st = self.state.lock();
            if st.destroyed {
                return;
            }
            (st.generation, st.session.clone())
        };
        let stats = match session {
            Some(session) => session.stats().await.ok(),
            None => None,
        };
        let bitrates = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            match stats {
                Some(stats) if st.generation == generation => Bitrates {
                    incoming: stats
                        .bytes_received
                        .map(|bytes| st.incoming.record(bytes, stats.timestamp_ms))
                        .unwrap_or(0),
                    outgoing: stats
                        .bytes_sent
                        .map(|bytes| st.outgoing.record(bytes, stats.timestamp_ms))
                        .unwrap_or(0),
                },
                _ => Bitrates::default(),
            }
        };
        self.emit(LinkEvent::Bitrates(bitrates));
    }

    async fn pump_session_events(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                break;
            }
            match event {
                SessionEvent::NegotiationNeeded => self.request_negotiation(generation),
                SessionEvent::IceCandidate(candidate) => match serde_json::to_string(&candidate) {
                    Ok(content) => self.send_signal(
                        generation,
                        Outgoing::Content(ContentKind::IceCandidate, content),
                    ),
                    Err(err) => {
                        tracing::warn!(target = "mesh", error = %err, "failed to encode local candidate");
                    }
                },
                SessionEvent::SignalingState(state) => self.emit(LinkEvent::SignalingState(state)),
                SessionEvent::ConnectionState(state) => {
                    self.emit(LinkEvent::ConnectionState(state))
                }
                SessionEvent::IceConnectionState(crate::session::IceConnectionState::Failed) => {
                    tracing::warn!(target = "mesh", peer = %self.peer_id, "ice connection failed");
                    self.restart("ice connection failed");
                    break;
                }
                SessionEvent::IceConnectionState(state) => {
                    tracing::trace!(target = "mesh", peer = %self.peer_id, state = ?state, "ice connection state");
                }
                SessionEvent::Track(track) => self.emit(LinkEvent::Track(track)),
            }
        }
    }

    async fn run_jobs(self: Arc<Self>, generation: u64, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            if !self.is_current(generation) {
                break;
            }
            match job {
                Job::Negotiate => self.negotiate(generation).await,
                Job::Content { kind, content } => {
                    self.process_content(generation, kind, content).await
                }
                Job::SyncTracks(tracks) => self.sync_tracks(generation, tracks).await,
            }
        }
    }

    fn session_for(&self, generation: u64) -> Option<Arc<dyn NativeSession>> {
        let st = self.state.lock();
        if st.destroyed || st.generation != generation {
            return None;
        }
        st.session.clone()
    }
}

fn release_native(
    session: Option<Arc<dyn NativeSession>>,
    control: Option<Arc<dyn ControlChannel>>,
) {
    if session.is_none() && control.is_none() {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        if let Some(control) = control {
            control.close().await;
        }
        if let Some(session) = session {
            session.close().await;
        }
    });
}
