//! Registry of peer links for one local participant.
//!
//! The manager owns every [`PeerLink`], follows relay reachability for itself
//! and for each remote participant, and routes inbound envelopes to the link
//! they belong to. Reachability is edge-triggered: connects and pauses fire
//! once per transition.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::error::{MeshError, MeshResult, RelayError};
use crate::link::{LinkEvent, LinkSnapshot, PeerLink, SignalSink};
use crate::protocol::{OutboundSignal, SignalMessage};
use crate::session::{LocalTrack, SessionFactory};

/// The external relay as seen by the manager.
pub trait SignalRelay: Send + Sync {
    fn send_signal(&self, signal: OutboundSignal) -> Result<(), RelayError>;

    /// Asks the caller to report a fresh roster via
    /// [`ConnectionManager::apply_roster`].
    fn request_roster(&self);
}

/// A link event tagged with the peer it came from.
#[derive(Debug, Clone)]
pub struct MeshEvent {
    pub peer_id: String,
    pub event: LinkEvent,
}

struct PeerEntry {
    link: Arc<PeerLink>,
    reachable: bool,
    waiting: bool,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    peers: HashMap<String, PeerEntry>,
    self_reachable: bool,
    input_tracks: Vec<LocalTrack>,
    destroyed: bool,
}

struct ManagerInner {
    local_id: String,
    config: LinkConfig,
    factory: Arc<dyn SessionFactory>,
    relay: Arc<dyn SignalRelay>,
    state: Mutex<ManagerState>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<MeshEvent>>>,
}

/// Relay path handed to every link. Holds the manager weakly so links never
/// keep it alive.
struct ManagerRelaySink {
    manager: Weak<ManagerInner>,
}

impl SignalSink for ManagerRelaySink {
    fn send_signal(&self, signal: OutboundSignal) {
        match self.manager.upgrade() {
            Some(manager) => manager.send_outbound(signal),
            None => tracing::debug!(
                target = "mesh",
                peer = %signal.to,
                "dropping signal for released manager"
            ),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// The relay starts out unreachable; report it with
    /// [`set_self_reachable`](Self::set_self_reachable).
    pub fn new(
        local_id: impl Into<String>,
        config: LinkConfig,
        factory: Arc<dyn SessionFactory>,
        relay: Arc<dyn SignalRelay>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                local_id: local_id.into(),
                config,
                factory,
                relay,
                state: Mutex::new(ManagerState::default()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Registers a listener. Dropping the receiver detaches it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MeshEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().push(tx);
        rx
    }

    pub fn register_peer(&self, peer_id: &str, reachable: bool) -> MeshResult<()> {
        self.inner.register_peer(peer_id, reachable)
    }

    pub fn unregister_peer(&self, peer_id: &str) -> MeshResult<()> {
        self.inner.unregister_peer(peer_id)
    }

    pub fn set_self_reachable(&self, reachable: bool) {
        self.inner.set_self_reachable(reachable);
    }

    pub fn set_peer_reachable(&self, peer_id: &str, reachable: bool) -> MeshResult<()> {
        self.inner.set_peer_reachable(peer_id, reachable)
    }

    pub fn set_input_tracks(&self, tracks: Vec<LocalTrack>) {
        self.inner.set_input_tracks(tracks);
    }

    pub fn route_inbound_signal(&self, message: SignalMessage) -> MeshResult<()> {
        self.inner.route_inbound_signal(message)
    }

    /// Parses a raw relay payload and routes it. Malformed payloads are logged
    /// and dropped.
    pub fn route_inbound_payload(&self, payload: &str) -> MeshResult<()> {
        match SignalMessage::parse(payload) {
            Ok(message) => self.inner.route_inbound_signal(message),
            Err(err) => {
                tracing::warn!(target = "mesh", error = %err, "dropping malformed relay payload");
                Ok(())
            }
        }
    }

    /// Relay path for outbound signals. Links call this through their sink.
    pub fn send_outbound(&self, signal: OutboundSignal) {
        self.inner.send_outbound(signal);
    }

    /// Reconciles the registry with the relay's view of the room: registers
    /// newcomers, unregisters departed peers and updates reachability.
    pub fn apply_roster(&self, roster: &HashMap<String, bool>) -> MeshResult<()> {
        let departed: Vec<String> = {
            let st = self.inner.state.lock();
            st.peers
                .keys()
                .filter(|peer_id| !roster.contains_key(*peer_id))
                .cloned()
                .collect()
        };
        for peer_id in departed {
            self.inner.unregister_peer(&peer_id)?;
        }

        for (peer_id, reachable) in roster {
            if *peer_id == self.inner.local_id {
                continue;
            }
            let known = self.inner.state.lock().peers.contains_key(peer_id);
            if known {
                self.inner.set_peer_reachable(peer_id, *reachable)?;
            } else {
                self.inner.register_peer(peer_id, *reachable)?;
            }
        }
        Ok(())
    }

    pub fn self_reachable(&self) -> bool {
        self.inner.state.lock().self_reachable
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_peer_reachable(&self, peer_id: &str) -> Option<bool> {
        self.inner
            .state
            .lock()
            .peers
            .get(peer_id)
            .map(|entry| entry.reachable)
    }

    /// Whether the peer's link was paused because it tried to use an
    /// unreachable relay.
    pub fn is_waiting(&self, peer_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .peers
            .get(peer_id)
            .is_some_and(|entry| entry.waiting)
    }

    pub fn snapshot(&self, peer_id: &str) -> Option<LinkSnapshot> {
        let link = self.inner.link(peer_id)?;
        Some(link.snapshot())
    }

    /// Forces a reset of one peer's link.
    pub fn reset_peer(&self, peer_id: &str, reason: &str) -> MeshResult<()> {
        let link = self
            .inner
            .link(peer_id)
            .ok_or_else(|| MeshError::UnknownPeer(peer_id.to_string()))?;
        link.reset(reason);
        Ok(())
    }

    /// Unregisters every peer and detaches all listeners.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl ManagerInner {
    fn link(&self, peer_id: &str) -> Option<Arc<PeerLink>> {
        self.state
            .lock()
            .peers
            .get(peer_id)
            .map(|entry| Arc::clone(&entry.link))
    }

    fn publish(&self, event: MeshEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    fn register_peer(self: &Arc<Self>, peer_id: &str, reachable: bool) -> MeshResult<()> {
        let (link, tracks, connect) = {
            let mut st = self.state.lock();
            if st.destroyed {
                return Err(MeshError::Destroyed);
            }
            if st.peers.contains_key(peer_id) {
                return Err(MeshError::DuplicatePeer(peer_id.to_string()));
            }
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let sink = Arc::new(ManagerRelaySink {
                manager: Arc::downgrade(self),
            });
            let link = Arc::new(PeerLink::new(
                self.local_id.clone(),
                peer_id,
                self.config.clone(),
                Arc::clone(&self.factory),
                sink,
                events_tx,
            )?);
            let forwarder = tokio::spawn(forward_link_events(
                Arc::downgrade(self),
                peer_id.to_string(),
                events_rx,
            ));
            st.peers.insert(
                peer_id.to_string(),
                PeerEntry {
                    link: Arc::clone(&link),
                    reachable,
                    waiting: false,
                    forwarder,
                },
            );
            (link, st.input_tracks.clone(), st.self_reachable && reachable)
        };

        tracing::info!(target = "mesh", peer = %peer_id, reachable, "registered peer");
        link.set_input_tracks(tracks);
        if connect {
            link.connect();
        }
        Ok(())
    }

    fn unregister_peer(&self, peer_id: &str) -> MeshResult<()> {
        let entry = self
            .state
            .lock()
            .peers
            .remove(peer_id)
            .ok_or_else(|| MeshError::UnknownPeer(peer_id.to_string()))?;
        tracing::info!(target = "mesh", peer = %peer_id, "unregistered peer");
        entry.link.destroy();
        entry.forwarder.abort();
        Ok(())
    }

    fn set_self_reachable(&self, reachable: bool) {
        let links: Vec<Arc<PeerLink>> = {
            let mut st = self.state.lock();
            if st.destroyed || st.self_reachable == reachable {
                return;
            }
            st.self_reachable = reachable;
            st.peers
                .values_mut()
                .filter(|entry| !reachable || entry.reachable)
                .map(|entry| {
                    if reachable {
                        entry.waiting = false;
                    }
                    Arc::clone(&entry.link)
                })
                .collect()
        };

        tracing::info!(target = "mesh", reachable, "relay reachability changed");
        for link in links {
            if link.control_operational() {
                continue;
            }
            if reachable {
                link.connect();
            } else {
                link.pause();
            }
        }
    }

    fn set_peer_reachable(&self, peer_id: &str, reachable: bool) -> MeshResult<()> {
        let (link, self_reachable) = {
            let mut st = self.state.lock();
            let self_reachable = st.self_reachable;
            let entry = st
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| MeshError::UnknownPeer(peer_id.to_string()))?;
            if entry.reachable == reachable {
                return Ok(());
            }
            entry.reachable = reachable;
            if reachable && self_reachable {
                entry.waiting = false;
            }
            (Arc::clone(&entry.link), self_reachable)
        };

        tracing::debug!(target = "mesh", peer = %peer_id, reachable, "peer reachability changed");
        if link.control_operational() {
            return Ok(());
        }
        if !reachable {
            link.pause();
        } else if self_reachable {
            link.connect();
        }
        Ok(())
    }

    fn set_input_tracks(&self, tracks: Vec<LocalTrack>) {
        let links: Vec<Arc<PeerLink>> = {
            let mut st = self.state.lock();
            st.input_tracks = tracks.clone();
            st.peers
                .values()
                .map(|entry| Arc::clone(&entry.link))
                .collect()
        };
        for link in links {
            link.set_input_tracks(tracks.clone());
        }
    }

    fn route_inbound_signal(&self, message: SignalMessage) -> MeshResult<()> {
        if message.to != self.local_id {
            return Err(MeshError::Misaddressed {
                to: message.to,
                local: self.local_id.clone(),
            });
        }
        match self.link(&message.from) {
            Some(link) => {
                link.handle_signal(message)?;
                Ok(())
            }
            None => {
                tracing::debug!(
                    target = "mesh",
                    peer = %message.from,
                    kind = message.body.type_name(),
                    "signal from unknown peer, requesting roster"
                );
                self.relay.request_roster();
                Ok(())
            }
        }
    }

    fn send_outbound(&self, signal: OutboundSignal) {
        let (self_reachable, link) = {
            let mut st = self.state.lock();
            let self_reachable = st.self_reachable;
            let link = st.peers.get_mut(&signal.to).map(|entry| {
                if !self_reachable {
                    entry.waiting = true;
                }
                Arc::clone(&entry.link)
            });
            (self_reachable, link)
        };

        let Some(link) = link else {
            tracing::error!(
                target = "mesh",
                peer = %signal.to,
                kind = signal.body.type_name(),
                "outbound signal for unregistered peer"
            );
            return;
        };
        if !self_reachable {
            tracing::error!(
                target = "mesh",
                peer = %signal.to,
                kind = signal.body.type_name(),
                "link tried to use the relay while it is unreachable"
            );
            link.pause();
            return;
        }
        if let Err(err) = self.relay.send_signal(signal) {
            tracing::warn!(target = "mesh", error = %err, "relay send failed");
        }
    }

    fn destroy(&self) {
        let entries: Vec<(String, PeerEntry)> = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.input_tracks.clear();
            st.peers.drain().collect()
        };
        for (peer_id, entry) in entries {
            tracing::debug!(target = "mesh", peer = %peer_id, "tearing down link");
            entry.link.destroy();
            entry.forwarder.abort();
        }
        self.listeners.lock().clear();
        tracing::info!(target = "mesh", local = %self.local_id, "connection manager destroyed");
    }
}

async fn forward_link_events(
    manager: Weak<ManagerInner>,
    peer_id: String,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.publish(MeshEvent {
            peer_id: peer_id.clone(),
            event,
        });
    }
}
