//! Peer table for the low-latency channel
//!
//! This module tracks which network addresses are live peers:
//! - Fixed pool of slots, the lowest free slot is always taken first
//! - Stable peer ids mapped to slots, with O(1) lookup by id and address
//! - Idempotent handshake: an address already known keeps its id
//! - Timeout sweep that evicts silent peers exactly once
//!
//! Evictions are edge-triggered: each evicted id is reported once through
//! [`PeerTable::drain_lost`] and never again.

use log::{error, info, warn};
use shared::{IdAllocator, PeerId};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("no free peer slot ({max_peers} in use)")]
    Full { max_peers: usize },

    #[error("slot {slot} is held by live peer {incumbent}, refusing peer {id}")]
    SlotOccupied {
        slot: usize,
        incumbent: PeerId,
        id: PeerId,
    },

    #[error("slot {slot} is outside the table (size {max_peers})")]
    NoSuchSlot { slot: usize, max_peers: usize },

    #[error("peer id {0} is already live in another slot")]
    DuplicateId(PeerId),
}

/// One live peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Last time any valid frame was received from this peer
    pub last_contact: Instant,
}

impl PeerRecord {
    /// Returns true if nothing was heard from this peer for longer than `timeout`
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_contact) > timeout
    }
}

#[derive(Debug)]
pub struct PeerTable {
    slots: Vec<Option<PeerRecord>>,
    free: BTreeSet<usize>,
    by_id: HashMap<PeerId, usize>,
    by_addr: HashMap<SocketAddr, usize>,
    lost: Vec<PeerId>,
    timeout: Duration,
}

impl PeerTable {
    pub fn new(max_peers: usize, timeout: Duration) -> Self {
        Self {
            slots: vec![None; max_peers],
            free: (0..max_peers).collect(),
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
            lost: Vec::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_peers(&self) -> usize {
        self.slots.len()
    }

    /// Lowest slot not held by a live peer
    pub fn available_slot(&self) -> Option<usize> {
        self.free.first().copied()
    }

    /// Puts a peer in `slot`; a slot held by a live peer is left untouched
    pub fn set_slot(
        &mut self,
        slot: usize,
        id: PeerId,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<&PeerRecord, PeerError> {
        let max_peers = self.max_peers();
        let entry = self
            .slots
            .get(slot)
            .ok_or(PeerError::NoSuchSlot { slot, max_peers })?;

        if let Some(incumbent) = entry {
            let err = PeerError::SlotOccupied {
                slot,
                incumbent: incumbent.id,
                id,
            };
            error!("{} (ignored)", err);
            return Err(err);
        }
        if self.by_id.contains_key(&id) {
            error!("peer {} is already live, refusing second slot {}", id, slot);
            return Err(PeerError::DuplicateId(id));
        }

        self.free.remove(&slot);
        self.by_id.insert(id, slot);
        self.by_addr.insert(addr, slot);
        let record = self.slots[slot].insert(PeerRecord {
            id,
            addr,
            last_contact: now,
        });
        Ok(record)
    }

    /// Registers `addr`, or returns its existing id if it is already live
    pub fn handshake(
        &mut self,
        addr: SocketAddr,
        now: Instant,
        ids: &mut IdAllocator,
    ) -> Result<PeerId, PeerError> {
        if let Some(id) = self.touch(addr, now) {
            info!("reinit from old peer {}", id);
            return Ok(id);
        }

        let slot = self.available_slot().ok_or(PeerError::Full {
            max_peers: self.max_peers(),
        })?;
        let id = ids.fresh();
        self.set_slot(slot, id, addr, now)?;

        info!("assigned ID {} to new peer {}", id, addr);
        Ok(id)
    }

    /// Refreshes the last-contact time of the peer at `addr`
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> Option<PeerId> {
        let slot = *self.by_addr.get(&addr)?;
        let record = self.slots[slot].as_mut()?;
        record.last_contact = now;
        Some(record.id)
    }

    pub fn id_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.get_by_addr(addr).map(|record| record.id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerRecord> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot].as_ref()
    }

    pub fn get_by_addr(&self, addr: SocketAddr) -> Option<&PeerRecord> {
        let slot = *self.by_addr.get(&addr)?;
        self.slots[slot].as_ref()
    }

    pub fn addr_of(&self, id: PeerId) -> Option<SocketAddr> {
        self.get(id).map(|record| record.addr)
    }

    pub fn is_alive(&self, id: PeerId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Tears a peer down and queues it for [`drain_lost`](Self::drain_lost)
    pub fn kill(&mut self, id: PeerId) -> bool {
        let slot = match self.by_id.remove(&id) {
            Some(slot) => slot,
            None => {
                warn!("cannot kill dead peer {} (ignored)", id);
                return false;
            }
        };

        if let Some(record) = self.slots[slot].take() {
            self.by_addr.remove(&record.addr);
        }
        self.free.insert(slot);
        self.lost.push(id);
        true
    }

    /// Evicts every peer silent for longer than the timeout
    ///
    /// Returns the number of peers evicted by this sweep.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let expired: Vec<(PeerId, SocketAddr, Duration)> = self
            .slots
            .iter()
            .flatten()
            .filter(|record| record.is_timed_out(now, timeout))
            .map(|record| {
                (
                    record.id,
                    record.addr,
                    now.saturating_duration_since(record.last_contact),
                )
            })
            .collect();

        for (id, addr, silence) in &expired {
            error!(
                "no frame from peer {} at {} for {} ms, dropping peer",
                id,
                addr,
                silence.as_millis()
            );
            self.kill(*id);
        }

        expired.len()
    }

    /// Peers lost since the previous call
    pub fn drain_lost(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.lost)
    }

    /// All live peers with their addresses
    pub fn addrs(&self) -> Vec<(PeerId, SocketAddr)> {
        self.slots
            .iter()
            .flatten()
            .map(|record| (record.id, record.addr))
            .collect()
    }

    /// Returns the number of live peers
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if no peer is live
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
