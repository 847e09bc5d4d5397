//! Headless client exercising the full session flow against a running server

use clap::Parser;
use log::{info, warn};
use server::bulk;
use server::ring::HistoryRing;
use shared::control::{Control, ControlFrame, MOVE_RIGHT};
use shared::frame::{split_burst, WireFrame, MAX_FRAME_SIZE};
use shared::snapshot::{SnapshotView, WorldConfig};
use shared::{
    config_request, handshake_request, opcode, ArenaLayout, HandshakeReply, SnapshotId, StaticInfo, Tick, ACK_SIZE,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

/// Controls repeated in every frame
const RESEND: usize = 3;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8890")]
    server: SocketAddr,
    /// Player name
    #[clap(short, long, default_value = "tester")]
    name: String,
    /// How long to play, in seconds
    #[clap(short, long, default_value = "10")]
    duration: u64,
}

/// Sends `frame` and waits for the first reply carrying `expected`
async fn request(
    socket: &UdpSocket,
    frame: &WireFrame,
    expected: u8,
) -> Result<WireFrame, Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    for attempt in 1..=5 {
        socket.send(frame.as_bytes()).await?;

        let deadline = Instant::now() + Duration::from_millis(500);
        while let Ok(received) = timeout(deadline.saturating_duration_since(Instant::now()), socket.recv(&mut buf)).await {
            let len = received?;
            for reply in split_burst(&buf[..len]) {
                let reply = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("dropping rest of datagram: {}", e);
                        break;
                    }
                };
                if reply.opcode() == expected {
                    return Ok(reply);
                }
                if reply.opcode() == opcode::WRONG_CONFIG {
                    return Err("server rejected the configuration".into());
                }
            }
        }
        warn!("no reply to opcode {} (attempt {})", frame.opcode(), attempt);
    }
    Err(format!("server never answered opcode {}", frame.opcode()).into())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(args.server).await?;
    info!("client socket bound to {}", socket.local_addr()?);

    let reply = request(&socket, &handshake_request()?, opcode::INIT).await?;
    let handshake = HandshakeReply::decode(reply.payload())?.ok_or("bad handshake magic")?;
    info!(
        "connected as peer {} (timeout {} ms)",
        handshake.peer_id, handshake.timeout_ms
    );

    let reply = request(&socket, &WireFrame::new(opcode::STATIC_INFO), opcode::STATIC_INFO).await?;
    let info = StaticInfo::decode(reply.payload())?;
    let blobs = bulk::download(SocketAddr::new(args.server.ip(), info.port)).await?;
    let received: usize = blobs.iter().map(|b| b.len() + shared::BLOB_PREFIX_SIZE).sum();
    info!("downloaded {} of {} static bytes", received, info.total_size);
    if let Some(layout) = blobs.first() {
        let layout = ArenaLayout::from_bytes(layout)?;
        info!(
            "arena {}x{}, {} spawn points",
            layout.width,
            layout.height,
            layout.spawn_points.len()
        );
    }

    let reply = request(&socket, &config_request(&args.name)?, opcode::CONFIG).await?;
    let (config, initial) = WorldConfig::decode(reply.payload())?;
    let own = initial.own.map(|e| e.id);
    info!(
        "configured: {} Hz controls, {} Hz snapshots, entity {:?}",
        config.client_rate, config.server_rate, own
    );

    socket.send(WireFrame::new(opcode::CLIENT_READY).as_bytes()).await?;

    let mut acks: HistoryRing<()> = HistoryRing::new(ACK_SIZE * 8);
    let mut last_snapshot: SnapshotId = initial.id;
    let mut recent: VecDeque<Control> = VecDeque::with_capacity(RESEND);
    let mut ticker = interval(Duration::from_secs(1) / config.client_rate.max(1) as u32);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let end = Instant::now() + Duration::from_secs(args.duration);
    let mut tick: Tick = 0;
    let mut snapshots = 0usize;
    let mut buf = vec![0u8; MAX_FRAME_SIZE];

    while Instant::now() < end {
        tokio::select! {
            _ = ticker.tick() => {
                tick += 1;
                let control = Control {
                    movement: MOVE_RIGHT,
                    facing_angle: (tick as f32 / 30.0).sin(),
                    shoot: tick % 30 == 0,
                    ..Control::new(tick)
                };
                if recent.len() == RESEND {
                    recent.pop_front();
                }
                recent.push_back(control);

                let mut ack = [0u8; ACK_SIZE];
                acks.make_ack(&mut ack);
                let mut burst = Vec::new();
                for control in &recent {
                    let frame = ControlFrame { last_snapshot, ack, control: *control }.encode()?;
                    burst.extend_from_slice(frame.as_bytes());
                }
                socket.send(&burst).await?;
            }
            received = socket.recv(&mut buf) => {
                let len = received?;
                for frame in split_burst(&buf[..len]) {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("dropping rest of datagram: {}", e);
                            break;
                        }
                    };
                    match frame.opcode() {
                        opcode::SNAPSHOT => {
                            let view = SnapshotView::decode(frame.payload())?;
                            acks.write(view.id, ());
                            last_snapshot = last_snapshot.max(view.id);
                            snapshots += 1;
                            if let Some(own) = &view.own {
                                info!(
                                    "snapshot {} (tick {}, applied {}): at ({:.1}, {:.1}), hp {}, {} others",
                                    view.id, view.tick, view.client_tick, own.x, own.y, own.health, view.others.len()
                                );
                            }
                        }
                        opcode::PONG => {}
                        op => warn!("unexpected opcode {}", op),
                    }
                }
            }
        }
    }

    info!("test client finished after {} ticks, {} snapshots", tick, snapshots);
    Ok(())
}
