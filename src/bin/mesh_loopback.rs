//! Zwei Teilnehmer im selben Prozess, verbunden über den In-Memory Hub
//! und echte WebRTC Peer Connections (nur Host-Candidates).

use anyhow::{Context, Result};
use pulse_mesh::call_engine::{MediaConstraints, VirtualMediaDevices, WebRtcPeerFactory};
use pulse_mesh::config::IceConfig;
use pulse_mesh::signaling::MemoryHub;
use pulse_mesh::{ConnectionState, EngineEvent, MeetingSession, MeshConfig};
use std::sync::Arc;
use std::time::Duration;

const MEETING_ID: &str = "loopback";
const RUN_FOR: Duration = Duration::from_secs(15);

async fn participant(config: &MeshConfig, hub: &MemoryHub) -> Result<MeetingSession> {
    let session = MeetingSession::with_backend(
        config,
        Arc::new(hub.clone()),
        Arc::new(WebRtcPeerFactory::new()),
        Arc::new(VirtualMediaDevices),
    );
    session
        .engine()
        .initialize_local_stream(MediaConstraints::audio_only())
        .await
        .context("failed to acquire local media")?;
    Ok(session)
}

fn spawn_printer(name: &'static str, session: &MeetingSession) -> tokio::task::JoinHandle<()> {
    let mut events = session.engine().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::ConnectionStateChanged { user_id, state } => {
                    println!("[{}] connection to {}: {:?}", name, user_id, state);
                }
                EngineEvent::ConnectionQualityChanged { user_id, quality } => {
                    println!("[{}] quality of {}: {:?}", name, user_id, quality);
                }
                EngineEvent::SessionStateChanged(state) => {
                    println!("[{}] session: {:?}", name, state);
                }
                EngineEvent::ParticipantJoined { user_id, user_name } => {
                    println!("[{}] {} ({}) joined", name, user_name, user_id);
                }
                EngineEvent::Error { user_id, message } => {
                    eprintln!("[{}] error ({:?}): {}", name, user_id, message);
                }
                _ => {}
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    pulse_mesh::init_tracing();

    let mut config = MeshConfig::from_env();
    config.ice = IceConfig::host_only();

    let hub = MemoryHub::new();
    let alice = participant(&config, &hub).await?;
    let bob = participant(&config, &hub).await?;
    let printers = [spawn_printer("alice", &alice), spawn_printer("bob", &bob)];

    alice.join(MEETING_ID, "alice", "Alice").await?;
    bob.join(MEETING_ID, "bob", "Bob").await?;

    let connected = tokio::time::timeout(RUN_FOR, async {
        loop {
            let a = alice.engine().connection_state("bob");
            let b = bob.engine().connection_state("alice");
            if a == Some(ConnectionState::Connected) && b == Some(ConnectionState::Connected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_ok();

    if connected {
        println!("mesh established, sampling quality for a few seconds");
        tokio::time::sleep(config.stats_interval() * 3).await;
        println!(
            "overall quality: alice={:?} bob={:?}",
            alice.engine().overall_quality(),
            bob.engine().overall_quality()
        );
    } else {
        eprintln!("peers did not connect within {:?}", RUN_FOR);
    }

    alice.leave().await;
    bob.leave().await;
    for printer in printers {
        printer.abort();
    }

    anyhow::ensure!(connected, "loopback mesh did not connect");
    Ok(())
}
