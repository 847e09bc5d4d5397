//! Authoritative server loop
//!
//! One task owns everything: the transport, the sessions, the world and the
//! snapshot history. Each [`step`](Server::step) waits for traffic no longer
//! than the time left until the next tick deadline, dispatches what arrived,
//! then runs whichever ticks came due:
//!
//! - input ticks (client rate) hand every session its paced controls and
//!   resolve the shots they fire against the shooter's perceived world
//! - snapshot ticks (server rate) capture the world and send each ready
//!   session its tailored snapshot
//!
//! Ticks that were missed are logged and skipped, never replayed.

use crate::bulk::{BulkSender, BulkState, PortPool};
use crate::clock::{TickClock, TickEvent};
use crate::config::ServerConfig;
use crate::game::World;
use crate::history::SnapshotHistory;
use crate::input::ControlScript;
use crate::lag::{self, HitOutcome, Shot};
use crate::session::Session;
use crate::transport::{Transport, TransportError};
use log::{debug, error, info, warn};
use shared::control::{ack_bit, ControlFrame};
use shared::frame::{FrameError, FrameReader, WireFrame};
use shared::snapshot::{EntityKind, Snapshot, WorldConfig};
use shared::{opcode, EntityId, IdAllocator, PeerId, StaticInfo, Tick, ACK_SIZE, NAME_SIZE};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Server<W: World> {
    config: ServerConfig,
    transport: Transport,
    ids: IdAllocator,
    world: W,
    sessions: BTreeMap<EntityId, Session>,
    by_peer: HashMap<PeerId, EntityId>,
    history: SnapshotHistory,
    input_clock: TickClock,
    snapshot_clock: TickClock,
    input_tick: Tick,
    ports: PortPool,
    bulk: HashMap<PeerId, BulkSender>,
}

impl<W: World> Server<W> {
    pub async fn bind(config: ServerConfig, world: W) -> Result<Self, ServerError> {
        let transport = Transport::bind(&config.bind_addr(), config.max_peers, config.peer_timeout).await?;
        let start = Instant::now();

        Ok(Self {
            transport,
            ids: IdAllocator::new(),
            world,
            sessions: BTreeMap::new(),
            by_peer: HashMap::new(),
            history: SnapshotHistory::new(config.retention_ticks()),
            input_clock: TickClock::new(start, config.input_period()),
            snapshot_clock: TickClock::new(start, config.snapshot_period()),
            input_tick: 0,
            ports: PortPool::new(config.bulk_port_first, config.bulk_port_count),
            bulk: HashMap::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.transport.local_addr()?)
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Last input tick applied
    pub fn input_tick(&self) -> Tick {
        self.input_tick
    }

    /// Adds a player driven by `script` instead of a peer
    pub fn add_bot(&mut self, name: &str, script: impl ControlScript + 'static) -> EntityId {
        let entity = self.world.spawn(name, EntityKind::ControlledEntity, &mut self.ids);
        self.sessions.insert(entity, Session::scripted(entity, script));
        info!("bot '{}' joined (entity {})", name, entity);
        entity
    }

    /// Runs until `shutdown` resolves
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<(), ServerError> {
        tokio::pin!(shutdown);
        info!(
            "server running: {} Hz input, {} Hz snapshots, {} ticks of history",
            self.config.client_rate,
            self.config.server_rate,
            self.history.window()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    return Ok(());
                }
                result = self.step() => result?,
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// One pass of the loop: wait for traffic, dispatch it, run due ticks
    pub async fn step(&mut self) -> Result<(), ServerError> {
        let now = Instant::now();
        let wait = self
            .input_clock
            .until_next(now)
            .min(self.snapshot_clock.until_next(now));
        self.transport.update(wait, &mut self.ids).await?;

        for peer in self.transport.lost_connections() {
            self.drop_peer(peer);
        }
        while let Some(frame) = self.transport.pop() {
            self.handle_frame(frame).await;
        }

        let now = Instant::now();
        if let Some(event) = self.input_clock.poll(now) {
            self.input_step(event);
        }
        if let Some(event) = self.snapshot_clock.poll(now) {
            self.snapshot_step(event).await;
        }

        self.poll_bulk().await;
        Ok(())
    }

    fn drop_peer(&mut self, peer: PeerId) {
        if let Some(entity) = self.by_peer.remove(&peer) {
            self.sessions.remove(&entity);
            self.world.despawn(entity);
            info!("peer {} left, session {} closed", peer, entity);
        }
        if let Some(sender) = self.bulk.remove(&peer) {
            sender.close(&mut self.ports);
        }
    }

    fn session_mut(&mut self, peer: PeerId) -> Option<&mut Session> {
        let entity = self.by_peer.get(&peer)?;
        self.sessions.get_mut(entity)
    }

    async fn send(&self, peer: PeerId, frame: Result<WireFrame, FrameError>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("cannot encode message for peer {}: {}", peer, e);
                return;
            }
        };
        if let Err(e) = self.transport.send_to(peer, &frame).await {
            warn!("cannot send to peer {}: {}", peer, e);
        }
    }

    async fn handle_frame(&mut self, frame: WireFrame) {
        let peer = match frame.sender() {
            Some(peer) => peer,
            None => return,
        };

        match frame.opcode() {
            opcode::STATIC_INFO => self.handle_static_info(peer).await,
            opcode::CONFIG => self.handle_config(peer, frame.payload()).await,
            opcode::CLIENT_READY => match self.session_mut(peer) {
                Some(session) => {
                    session.ready = true;
                    info!("peer {} is ready", peer);
                }
                None => warn!("ready from peer {} without a session (dropped)", peer),
            },
            opcode::CONTROL_FRAME => self.handle_control(peer, frame.payload()),
            op => warn!("unexpected opcode {} from peer {} (dropped)", op, peer),
        }
    }

    async fn handle_static_info(&mut self, peer: PeerId) {
        if !self.bulk.contains_key(&peer) {
            let payloads = self.world.static_payloads();
            let opened = BulkSender::open(
                &mut self.ports,
                &self.config.host,
                peer,
                &payloads,
                self.config.bulk_timeout,
            )
            .await;

            match opened {
                Ok(sender) => {
                    self.bulk.insert(peer, sender);
                }
                Err(e) => {
                    warn!("cannot open bulk channel for peer {}: {}", peer, e);
                    return;
                }
            }
        }

        let info = match self.bulk.get(&peer) {
            Some(sender) => StaticInfo {
                port: sender.port(),
                total_size: sender.total_size() as u32,
            },
            None => return,
        };
        self.send(peer, info.encode()).await;
    }

    async fn handle_config(&mut self, peer: PeerId, payload: &[u8]) {
        let name = match FrameReader::new(payload).read_str() {
            Ok(name) if !name.is_empty() && name.len() < NAME_SIZE => name,
            _ => {
                warn!("malformed configuration request from peer {}", peer);
                self.send(peer, Ok(WireFrame::new(opcode::WRONG_CONFIG))).await;
                return;
            }
        };

        let entity = match self.by_peer.get(&peer) {
            Some(entity) => *entity,
            None => {
                let entity = self.world.spawn(&name, EntityKind::Player, &mut self.ids);
                self.sessions.insert(entity, Session::network(peer, entity));
                self.by_peer.insert(peer, entity);
                info!("peer {} joined as '{}' (entity {})", peer, name, entity);
                entity
            }
        };

        let initial = Snapshot {
            id: self.history.latest().map_or(0, |s| s.id),
            tick: self.input_tick,
            entities: self.world.entities(),
            despawned: Vec::new(),
        };
        let config = WorldConfig::new(self.config.client_rate, self.config.server_rate);
        let frame = config.encode(&initial, Some(entity), 0, self.world.geometry());
        self.send(peer, frame).await;
    }

    fn handle_control(&mut self, peer: PeerId, payload: &[u8]) {
        let frame = match ControlFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed control frame from peer {}: {}", peer, e);
                return;
            }
        };

        match self.session_mut(peer) {
            Some(session) => {
                session.controller.register_frame(&frame);
            }
            None => {
                warn!("control from peer {} without a session (dropped)", peer);
                return;
            }
        }

        let window = ACK_SIZE * 8;
        let missed = (0..window).filter(|&i| !ack_bit(&frame.ack, i)).count();
        if frame.last_snapshot as usize >= window && missed > window / 2 {
            debug!(
                "peer {} is missing {} of the {} snapshots before {}",
                peer, missed, window, frame.last_snapshot
            );
        }
    }

    fn input_step(&mut self, event: TickEvent) {
        if event.skipped > 0 {
            warn!("skipped {} input ticks before tick {}", event.skipped, event.tick);
        }
        let tick = event.tick;
        self.input_tick = tick;

        let mut shots: Vec<(Shot, Option<Tick>)> = Vec::new();
        for session in self.sessions.values_mut() {
            if session.is_scripted() {
                if let Some(entity) = self.world.entity(session.entity) {
                    session.controller.update(&entity, tick);
                }
            }

            for entry in session.controller.get_controls(tick) {
                // scripted players see the present
                let perceived = match entry.seen_snapshot {
                    _ if session.is_scripted() => Some(tick),
                    Some(id) => self.history.get_by_id(id).map(|snapshot| snapshot.tick),
                    None => None,
                };
                if let Some(shot) = self.world.apply_control(session.entity, &entry.control) {
                    shots.push((shot, perceived));
                }
            }
        }

        for (shot, perceived) in shots {
            let outcome = match perceived {
                Some(perceived) => lag::resolve(&self.history, &shot, perceived, self.world.geometry()),
                None => HitOutcome::NoSnapshot,
            };

            match outcome {
                HitOutcome::Hit {
                    target,
                    distance,
                    snapshot_tick,
                } => {
                    debug!(
                        "{} hit {} at {:.1} (seen at tick {}, now {})",
                        shot.shooter, target, distance, snapshot_tick, tick
                    );
                    self.world.hurt(target, shot.damage);
                }
                HitOutcome::NoSnapshot => debug!("shot by {} voided, no snapshot in reach", shot.shooter),
                HitOutcome::Occluded { .. } | HitOutcome::Miss => {}
            }
        }
    }

    async fn snapshot_step(&mut self, event: TickEvent) {
        if event.skipped > 0 {
            warn!("skipped {} snapshot ticks before tick {}", event.skipped, event.tick);
        }

        let world = &mut self.world;
        let snapshot = match self.history.capture(self.input_tick, || world.capture()) {
            Some(snapshot) => snapshot,
            None => return,
        };

        let geometry = self.world.geometry();
        let mut outgoing = Vec::new();
        for session in self.sessions.values().filter(|s| s.ready) {
            let peer = match session.peer {
                Some(peer) => peer,
                None => continue,
            };
            let client_tick = session.controller.last_tick().unwrap_or(0);
            match snapshot.encode_for(Some(session.entity), client_tick, geometry) {
                Ok(frame) => outgoing.push((peer, frame)),
                Err(e) => error!("cannot encode snapshot {} for peer {}: {}", snapshot.id, peer, e),
            }
        }

        if event.tick % self.config.server_rate.max(1) as u32 == 0 {
            debug!(
                "tick {}: {} peers, {} sessions, {} snapshots retained",
                self.input_tick,
                self.transport.peers().len(),
                self.sessions.len(),
                self.history.len()
            );
        }

        for (peer, frame) in outgoing {
            if let Err(e) = self.transport.send_to(peer, &frame).await {
                warn!("cannot send snapshot to peer {}: {}", peer, e);
            }
        }
    }

    async fn poll_bulk(&mut self) {
        let mut finished = Vec::new();
        for (peer, sender) in self.bulk.iter_mut() {
            match sender.update(Duration::ZERO).await {
                Ok(BulkState::Done) => finished.push(*peer),
                Ok(_) => {}
                Err(e) => {
                    warn!("{}", e);
                    finished.push(*peer);
                }
            }
        }

        for peer in finished {
            if let Some(sender) = self.bulk.remove(&peer) {
                sender.close(&mut self.ports);
            }
        }
    }
}
