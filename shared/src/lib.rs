//! Wire-level definitions shared by the server and its clients
//!
//! Anything both ends of a connection must agree on lives here: opcodes,
//! the handshake, frame layout, control and snapshot encodings, and the
//! static assets streamed over the bulk channel.

pub mod control;
pub mod frame;
pub mod geometry;
pub mod snapshot;

use frame::{FrameError, WireFrame};
use serde::{Deserialize, Serialize};

pub type PeerId = u32;
pub type EntityId = u32;
pub type SnapshotId = u32;
pub type Tick = u32;

/// Opcodes shared by both ends of the low-latency channel
pub mod opcode {
    /// Keepalive request, answered by the transport
    pub const PING: u8 = 1;
    /// Keepalive reply, absorbed by the transport
    pub const PONG: u8 = 2;
    /// Handshake, in both directions
    pub const INIT: u8 = 11;

    pub const STATIC_INFO: u8 = 12;
    pub const CONFIG: u8 = 13;
    pub const CLIENT_READY: u8 = 14;
    pub const WRONG_CONFIG: u8 = 21;
    pub const SNAPSHOT: u8 = 100;
    pub const CONTROL_FRAME: u8 = 101;
}

pub const HANDSHAKE_MAGIC: &[u8; 7] = b"hithere";

/// Client inputs per second
pub const CLIENT_RATE: u8 = 60;
/// Snapshots per second
pub const SERVER_RATE: u8 = 20;
/// Oldest perceived state the server will compensate for, in milliseconds
pub const MAX_PING_MS: u64 = 1500;
/// Ack bitmap width in bytes, one bit per tracked tick
pub const ACK_SIZE: usize = 2;
pub const MAX_N_WEAPONS: usize = 4;
/// Longest entity name on the wire, terminator included
pub const NAME_SIZE: usize = 50;
/// Stands for "no entity" wherever an entity id is expected
pub const NO_ENTITY: EntityId = u32::MAX;

/// Hands out process-unique ids for peers and entities
///
/// Owned by whoever drives the simulation and passed explicitly to the
/// code that mints identities.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    pub fn fresh(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == NO_ENTITY {
            self.next = 0;
        }
        id
    }
}

/// Builds the client's handshake request
pub fn handshake_request() -> Result<WireFrame, FrameError> {
    WireFrame::from_payload(opcode::INIT, HANDSHAKE_MAGIC)
}

/// Builds the client's configuration request, carrying the player name
pub fn config_request(name: &str) -> Result<WireFrame, FrameError> {
    let mut frame = WireFrame::new(opcode::CONFIG);
    frame.append_str(name)?;
    Ok(frame)
}

/// Server's answer to a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReply {
    pub peer_id: PeerId,
    pub timeout_ms: u32,
}

impl HandshakeReply {
    pub fn encode(&self) -> Result<WireFrame, FrameError> {
        let mut frame = WireFrame::new(opcode::INIT);
        frame.append(HANDSHAKE_MAGIC)?;
        frame.append_u32(self.peer_id)?;
        frame.append_u32(self.timeout_ms)?;
        Ok(frame)
    }

    /// Returns `None` if the payload does not start with the magic
    pub fn decode(payload: &[u8]) -> Result<Option<Self>, FrameError> {
        let mut reader = frame::FrameReader::new(payload);
        if reader.read_bytes(HANDSHAKE_MAGIC.len())? != HANDSHAKE_MAGIC {
            return Ok(None);
        }
        Ok(Some(Self {
            peer_id: reader.read_u32()?,
            timeout_ms: reader.read_u32()?,
        }))
    }
}

/// Reply to a static-info query: where and how much to download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticInfo {
    pub port: u16,
    pub total_size: u32,
}

impl StaticInfo {
    pub fn encode(&self) -> Result<WireFrame, FrameError> {
        let mut frame = WireFrame::new(opcode::STATIC_INFO);
        frame.append_u16(self.port)?;
        frame.append_u32(self.total_size)?;
        Ok(frame)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let mut reader = frame::FrameReader::new(payload);
        Ok(Self {
            port: reader.read_u16()?,
            total_size: reader.read_u32()?,
        })
    }
}

/// Static description of the arena, downloaded once over the bulk channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaLayout {
    pub width: f32,
    pub height: f32,
    pub spawn_points: Vec<geometry::Vector2>,
}

impl ArenaLayout {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Size of the length prefix in front of every bulk blob
pub const BLOB_PREFIX_SIZE: usize = 4;

/// Prefixes a bulk payload with its little-endian length
pub fn encode_blob(payload: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(BLOB_PREFIX_SIZE + payload.len());
    blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    blob.extend_from_slice(payload);
    blob
}
