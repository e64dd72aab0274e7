//! Runs two meeting participants in one process and lets them negotiate a
//! real WebRTC session through an in-memory relay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::Parser;
use meeting_mesh::{
    ConnectionManager, IceConfig, LinkEvent, MeshConfig, MeshEvent, OutboundSignal, RelayError,
    SignalRelay, WebRtcSessionFactory,
};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "mesh-loopback")]
struct Cli {
    #[arg(long, env = "MESH_LOOPBACK_SECS", default_value_t = 10)]
    duration_secs: u64,

    #[arg(long, default_value = "alice")]
    first: String,

    #[arg(long, default_value = "bob")]
    second: String,

    #[arg(long, help = "Only gather host candidates")]
    local_only: bool,

    #[arg(long, help = "Drop the relay for this many seconds halfway through")]
    outage_secs: Option<u64>,
}

/// One participant's side of the relay. Signals are stamped with the
/// participant's relay session version and handed to the pump.
struct LoopbackRelay {
    local_id: String,
    version: u64,
    online: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<(u64, OutboundSignal)>,
}

impl SignalRelay for LoopbackRelay {
    fn send_signal(&self, signal: OutboundSignal) -> Result<(), RelayError> {
        if !self.online.load(Ordering::Acquire) {
            return Err(RelayError::Unreachable);
        }
        self.outbound
            .send((self.version, signal))
            .map_err(|err| RelayError::Send(err.to_string()))
    }

    fn request_roster(&self) {
        info!(participant = %self.local_id, "roster refresh requested");
    }
}

fn session_version() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn spawn_pump(
    target: ConnectionManager,
    mut inbound: mpsc::UnboundedReceiver<(u64, OutboundSignal)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((version, signal)) = inbound.recv().await {
            if let Err(err) = target.route_inbound_signal(signal.with_version(version)) {
                warn!(error = %err, "loopback relay could not route signal");
            }
        }
    })
}

fn spawn_logger(
    participant: String,
    mut events: mpsc::UnboundedReceiver<MeshEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(MeshEvent { peer_id, event }) = events.recv().await {
            match event {
                LinkEvent::Bitrates(rates) => info!(
                    participant = %participant,
                    peer = %peer_id,
                    incoming_kbps = rates.incoming,
                    outgoing_kbps = rates.outgoing,
                    "bitrates"
                ),
                LinkEvent::Track(track) => info!(
                    participant = %participant,
                    peer = %peer_id,
                    track = %track.id,
                    "remote track"
                ),
                LinkEvent::ConnectionState(state) => info!(
                    participant = %participant,
                    peer = %peer_id,
                    state = ?state,
                    "connection state"
                ),
                LinkEvent::SignalingState(state) => info!(
                    participant = %participant,
                    peer = %peer_id,
                    state = ?state,
                    "signaling state"
                ),
                LinkEvent::Disconnected => {
                    warn!(participant = %participant, peer = %peer_id, "peer disconnected")
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    if cli.first == cli.second {
        bail!("participants need distinct ids");
    }

    let mut config = MeshConfig::from_env();
    if cli.local_only {
        config.ice = IceConfig::local_only();
    }

    let first_sessions = WebRtcSessionFactory::new(config.ice.clone())
        .context("failed to build webrtc api")?;
    let second_sessions = WebRtcSessionFactory::new(config.ice.clone())
        .context("failed to build webrtc api")?;

    let first_online = Arc::new(AtomicBool::new(true));
    let (first_tx, first_rx) = mpsc::unbounded_channel();
    let (second_tx, second_rx) = mpsc::unbounded_channel();
    let first = ConnectionManager::new(
        cli.first.clone(),
        config.link.clone(),
        Arc::new(first_sessions),
        Arc::new(LoopbackRelay {
            local_id: cli.first.clone(),
            version: session_version(),
            online: Arc::clone(&first_online),
            outbound: first_tx,
        }),
    );
    let second = ConnectionManager::new(
        cli.second.clone(),
        config.link.clone(),
        Arc::new(second_sessions),
        Arc::new(LoopbackRelay {
            local_id: cli.second.clone(),
            version: session_version(),
            online: Arc::new(AtomicBool::new(true)),
            outbound: second_tx,
        }),
    );

    let tasks = vec![
        spawn_pump(second.clone(), first_rx),
        spawn_pump(first.clone(), second_rx),
        spawn_logger(cli.first.clone(), first.subscribe()),
        spawn_logger(cli.second.clone(), second.subscribe()),
    ];

    let roster = HashMap::from([(cli.first.clone(), true), (cli.second.clone(), true)]);
    for manager in [&first, &second] {
        manager.set_self_reachable(true);
        manager
            .apply_roster(&roster)
            .context("failed to apply roster")?;
    }
    info!(
        first = %cli.first,
        second = %cli.second,
        seconds = cli.duration_secs,
        "loopback running"
    );

    let total = Duration::from_secs(cli.duration_secs);
    let run = async {
        match cli.outage_secs {
            Some(outage) => {
                tokio::time::sleep(total / 2).await;
                warn!(participant = %cli.first, outage, "simulating relay outage");
                first_online.store(false, Ordering::Release);
                first.set_self_reachable(false);
                tokio::time::sleep(Duration::from_secs(outage)).await;
                first_online.store(true, Ordering::Release);
                first.set_self_reachable(true);
                tokio::time::sleep(total / 2).await;
            }
            None => tokio::time::sleep(total).await,
        }
    };
    tokio::select! {
        _ = run => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    for (manager, peer) in [(&first, &cli.second), (&second, &cli.first)] {
        if let Some(snapshot) = manager.snapshot(peer) {
            info!(
                participant = %manager.local_id(),
                peer = %peer,
                handshake = ?snapshot.handshake,
                operational = snapshot.control_operational,
                relayed = snapshot.using_relay,
                generation = snapshot.generation,
                "final link state"
            );
        }
    }

    first.destroy();
    second.destroy();
    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
