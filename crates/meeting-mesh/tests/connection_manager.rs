mod common;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, quiet_config, settle, RELAY_VERSION};
use meeting_mesh::link::LinkEvent;
use meeting_mesh::protocol::{OutboundSignal, SignalBody};
use meeting_mesh::session::memory::{MemoryControlChannel, MemorySessionFactory};
use meeting_mesh::session::{ConnectionState, SessionEvent};
use meeting_mesh::{ConnectionManager, HandshakeState, MeshEvent, RelayError, SignalRelay};
use parking_lot::Mutex;

#[derive(Default)]
struct QueueRelay {
    queue: Mutex<VecDeque<OutboundSignal>>,
    roster_requests: Mutex<usize>,
}

impl QueueRelay {
    fn drain(&self) -> Vec<OutboundSignal> {
        self.queue.lock().drain(..).collect()
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn peek(&self) -> Vec<OutboundSignal> {
        self.queue.lock().iter().cloned().collect()
    }
}

impl SignalRelay for QueueRelay {
    fn send_signal(&self, signal: OutboundSignal) -> Result<(), RelayError> {
        self.queue.lock().push_back(signal);
        Ok(())
    }

    fn request_roster(&self) {
        *self.roster_requests.lock() += 1;
    }
}

struct Participant {
    manager: ConnectionManager,
    relay: Arc<QueueRelay>,
    sessions: Arc<MemorySessionFactory>,
}

impl Participant {
    fn new(id: &str) -> Self {
        let relay = Arc::new(QueueRelay::default());
        let sessions = MemorySessionFactory::new();
        let manager = ConnectionManager::new(
            id,
            quiet_config(),
            Arc::clone(&sessions) as _,
            Arc::clone(&relay) as _,
        );
        Self {
            manager,
            relay,
            sessions,
        }
    }

    fn control_channel(&self) -> Arc<MemoryControlChannel> {
        self.sessions
            .latest()
            .and_then(|session| session.control_channel())
            .expect("control channel")
    }
}

fn forward(from: &Participant, to: &Participant) -> usize {
    let signals = from.relay.drain();
    let count = signals.len();
    for signal in signals {
        to.manager
            .route_inbound_signal(signal.with_version(RELAY_VERSION))
            .expect("route signal");
    }
    count
}

async fn exchange(a: &Participant, b: &Participant) {
    for _ in 0..64 {
        settle().await;
        if forward(a, b) + forward(b, a) == 0 {
            settle().await;
            if a.relay.is_empty() && b.relay.is_empty() {
                return;
            }
        }
    }
    panic!("managers kept signaling");
}

fn requests(signals: &[OutboundSignal]) -> usize {
    signals
        .iter()
        .filter(|signal| signal.body == SignalBody::Requesting)
        .count()
}

async fn connected_pair() -> (Participant, Participant) {
    let a = Participant::new("a");
    let b = Participant::new("b");
    for (participant, peer) in [(&a, "b"), (&b, "a")] {
        participant.manager.set_self_reachable(true);
        participant
            .manager
            .register_peer(peer, true)
            .expect("register peer");
    }
    exchange(&a, &b).await;
    (a, b)
}

async fn make_operational(a: &Participant, b: &Participant) {
    let a_channel = a.control_channel();
    let b_channel = b.control_channel();
    MemoryControlChannel::pair(&a_channel, &b_channel);
    a_channel.open();
    b_channel.open();
    settle().await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    settle().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn managers_negotiate_over_relay() {
    init_tracing();
    let (a, b) = connected_pair().await;
    let a_view = a.manager.snapshot("b").expect("link to b");
    let b_view = b.manager.snapshot("a").expect("link to a");
    assert_eq!(a_view.handshake, HandshakeState::Synchronized);
    assert_eq!(b_view.handshake, HandshakeState::Synchronized);
    assert_eq!(a_view.token, b_view.token);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn relay_recovery_skips_operational_links() {
    init_tracing();
    let (a, b) = connected_pair().await;
    make_operational(&a, &b).await;
    let before = a.manager.snapshot("b").expect("link to b");
    assert!(before.control_operational);

    a.manager.set_self_reachable(false);
    a.manager.set_self_reachable(true);
    settle().await;

    let after = a.manager.snapshot("b").expect("link to b");
    assert_eq!(after.generation, before.generation);
    assert_eq!(after.token, before.token);
    assert!(after.control_operational);
    assert_eq!(requests(&a.relay.drain()), 0);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn relay_loss_pauses_links_still_negotiating() {
    init_tracing();
    let a = Participant::new("a");
    a.manager.set_self_reachable(true);
    a.manager.register_peer("b", true).expect("register b");
    a.manager.register_peer("c", false).expect("register c");
    assert_eq!(requests(&a.relay.drain()), 1);

    a.manager.set_self_reachable(false);
    let view = a.manager.snapshot("b").expect("link to b");
    assert_eq!(view.handshake, HandshakeState::New);
    assert!(!view.connecting);

    a.manager.set_self_reachable(true);
    let sent = a.relay.drain();
    assert_eq!(requests(&sent), 1);
    assert!(sent.iter().all(|signal| signal.to == "b"));

    a.manager.set_peer_reachable("c", true).expect("c reachable");
    assert_eq!(requests(&a.relay.drain()), 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failure_while_relay_is_down_waits_for_recovery() {
    init_tracing();
    let (a, b) = connected_pair().await;
    make_operational(&a, &b).await;
    let before = a.manager.snapshot("b").expect("link to b");

    a.manager.set_self_reachable(false);
    assert!(a.manager.snapshot("b").expect("link to b").control_operational);
    a.control_channel().fail("transport went away");
    settle().await;

    let paused = a.manager.snapshot("b").expect("link to b");
    assert_eq!(paused.generation, before.generation + 1);
    assert_eq!(paused.handshake, HandshakeState::New);
    assert!(!paused.connecting);
    assert!(a.manager.is_waiting("b"));
    assert!(a.relay.is_empty());

    a.manager.set_self_reachable(true);
    assert_eq!(requests(&a.relay.peek()), 1);
    exchange(&a, &b).await;
    let a_view = a.manager.snapshot("b").expect("link to b");
    let b_view = b.manager.snapshot("a").expect("link to a");
    assert_eq!(a_view.handshake, HandshakeState::Synchronized);
    assert_eq!(b_view.handshake, HandshakeState::Synchronized);
    assert_eq!(a_view.token, b_view.token);
    assert_ne!(a_view.token, before.token);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn signals_from_strangers_request_roster() {
    init_tracing();
    let (a, b) = connected_pair().await;
    b.manager.unregister_peer("a").expect("unregister a");

    a.manager.reset_peer("b", "test").expect("reset b");
    a.manager.set_peer_reachable("b", false).expect("b unreachable");
    a.manager.set_peer_reachable("b", true).expect("b reachable");
    assert_eq!(forward(&a, &b), 1);
    assert_eq!(*b.relay.roster_requests.lock(), 1);

    let roster = HashMap::from([("a".to_string(), true), ("b".to_string(), true)]);
    b.manager.apply_roster(&roster).expect("apply roster");
    assert_eq!(b.manager.peer_ids(), vec!["a".to_string()]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn link_events_reach_subscribers_tagged_by_peer() {
    init_tracing();
    let a = Participant::new("a");
    let mut events = a.manager.subscribe();
    a.manager.register_peer("b", false).expect("register b");

    let session = a.sessions.latest().expect("session");
    session.emit(SessionEvent::ConnectionState(ConnectionState::Connected));
    settle().await;

    let MeshEvent { peer_id, event } = events.recv().await.expect("event");
    assert_eq!(peer_id, "b");
    assert!(matches!(
        event,
        LinkEvent::ConnectionState(ConnectionState::Connected)
    ));

    drop(events);
    session.emit(SessionEvent::ConnectionState(ConnectionState::Failed));
    settle().await;
    let mut late = a.manager.subscribe();
    session.emit(SessionEvent::ConnectionState(ConnectionState::Closed));
    settle().await;
    let MeshEvent { event, .. } = late.recv().await.expect("event");
    assert!(matches!(
        event,
        LinkEvent::ConnectionState(ConnectionState::Closed)
    ));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn destroy_releases_every_link() {
    init_tracing();
    let (a, _b) = connected_pair().await;
    let session = a.sessions.latest().expect("session");
    a.manager.destroy();
    settle().await;
    assert!(a.manager.peer_ids().is_empty());
    assert!(session.is_closed());
}
