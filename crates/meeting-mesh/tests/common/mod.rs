#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use meeting_mesh::link::{LinkEvent, PeerLink, SignalSink};
use meeting_mesh::protocol::{ContentKind, HandshakeSignal, OutboundSignal, SignalBody};
use meeting_mesh::session::memory::{MemoryControlChannel, MemorySessionFactory};
use meeting_mesh::{LinkConfig, SignalMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

pub const RELAY_VERSION: u64 = 1;

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn quiet_config() -> LinkConfig {
    LinkConfig {
        report_bitrates: false,
        ..LinkConfig::default()
    }
}

/// Lets every spawned task run until it blocks. Never advances a paused clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Relay stand-in that holds outbound signals until the test delivers them.
#[derive(Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<OutboundSignal>>,
}

impl Outbox {
    pub fn drain(&self) -> Vec<OutboundSignal> {
        self.queue.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn peek(&self) -> Vec<OutboundSignal> {
        self.queue.lock().iter().cloned().collect()
    }
}

impl SignalSink for Outbox {
    fn send_signal(&self, signal: OutboundSignal) {
        self.queue.lock().push_back(signal);
    }
}

pub fn handshake(from: &str, to: &str, token: &str, signal: HandshakeSignal) -> SignalMessage {
    OutboundSignal {
        to: to.into(),
        from: from.into(),
        token: token.into(),
        body: SignalBody::handshake(signal),
    }
    .with_version(RELAY_VERSION)
}

pub fn content(
    from: &str,
    to: &str,
    token: &str,
    kind: ContentKind,
    payload: &str,
    counter: u64,
) -> SignalMessage {
    OutboundSignal {
        to: to.into(),
        from: from.into(),
        token: token.into(),
        body: SignalBody::content(kind, payload.into(), counter),
    }
    .with_version(RELAY_VERSION)
}

pub struct Side {
    pub link: PeerLink,
    pub outbox: Arc<Outbox>,
    pub sessions: Arc<MemorySessionFactory>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Side {
    pub fn new(local: &str, peer: &str, config: LinkConfig) -> Self {
        let outbox = Arc::new(Outbox::default());
        let sessions = MemorySessionFactory::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let link = PeerLink::new(
            local,
            peer,
            config,
            Arc::clone(&sessions) as _,
            Arc::clone(&outbox) as _,
            events_tx,
        )
        .expect("create link");
        Self {
            link,
            outbox,
            sessions,
            events,
        }
    }

    pub fn control_channel(&self) -> Arc<MemoryControlChannel> {
        self.sessions
            .latest()
            .and_then(|session| session.control_channel())
            .expect("control channel")
    }

    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Two links for the pair ("a", "b"). "a" is the polite side.
pub struct LinkPair {
    pub a: Side,
    pub b: Side,
}

impl LinkPair {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            a: Side::new("a", "b", config.clone()),
            b: Side::new("b", "a", config),
        }
    }

    pub fn deliver_to_a(&self) -> usize {
        deliver(&self.b.outbox, &self.a.link)
    }

    pub fn deliver_to_b(&self) -> usize {
        deliver(&self.a.outbox, &self.b.link)
    }

    /// Shuttles relay traffic both ways until neither side has anything left
    /// to say.
    pub async fn exchange(&self) -> usize {
        let mut moved = 0;
        for _ in 0..64 {
            settle().await;
            let round = self.deliver_to_b() + self.deliver_to_a();
            moved += round;
            if round == 0 {
                settle().await;
                if self.a.outbox.is_empty() && self.b.outbox.is_empty() {
                    return moved;
                }
            }
        }
        panic!("links kept signaling after {moved} messages");
    }

    /// Pairs and opens the two current control channels.
    pub async fn open_control_channels(&self) {
        let a = self.a.control_channel();
        let b = self.b.control_channel();
        MemoryControlChannel::pair(&a, &b);
        a.open();
        b.open();
        settle().await;
    }
}

fn deliver(from: &Outbox, to: &PeerLink) -> usize {
    let signals = from.drain();
    let count = signals.len();
    for signal in signals {
        to.handle_signal(signal.with_version(RELAY_VERSION))
            .expect("deliver signal");
    }
    count
}
