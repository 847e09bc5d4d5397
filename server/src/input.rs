//! Per-session input pacing
//!
//! Clients tick faster than the server simulates and resend recent controls
//! with every frame, so controls reach the server late, twice, or out of
//! order. The controller stores them in a [`HistoryRing`] keyed by client
//! tick and hands them to the simulation in order, skipping ticks that
//! never arrived, never returning the same tick twice, and never releasing
//! more ticks per call than server ticks have elapsed since the previous
//! delivery.

use crate::ring::HistoryRing;
use log::warn;
use shared::control::{Control, ControlFrame};
use shared::snapshot::EntityDesc;
use shared::{SnapshotId, Tick, ACK_SIZE};

/// Ticks of control history kept per session, one per ack bit
pub const CONTROL_HISTORY: usize = ACK_SIZE * 8;

/// A control paired with the newest snapshot its sender had when issuing it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacedControl {
    pub control: Control,
    /// `None` for locally produced controls
    pub seen_snapshot: Option<SnapshotId>,
}

/// Produces controls for sessions that are not driven by the network
pub trait ControlScript: Send {
    fn produce_control(&mut self, entity: &EntityDesc, tick: Tick) -> Control;
}

impl<F> ControlScript for F
where
    F: FnMut(&EntityDesc, Tick) -> Control + Send,
{
    fn produce_control(&mut self, entity: &EntityDesc, tick: Tick) -> Control {
        self(entity, tick)
    }
}

/// Where a session's controls come from
pub enum ControlSource {
    /// Control frames received from a peer
    Network,
    /// Generated locally once per server tick
    Scripted(Box<dyn ControlScript>),
}

impl std::fmt::Debug for ControlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlSource::Network => write!(f, "Network"),
            ControlSource::Scripted(_) => write!(f, "Scripted"),
        }
    }
}

#[derive(Debug)]
pub struct InputController {
    source: ControlSource,
    history: HistoryRing<PacedControl>,
    /// Client tick of the last control handed out
    last_ctrl_tick: Option<Tick>,
    /// Server tick at which controls were last handed out
    last_call_tick: Tick,
}

impl InputController {
    pub fn new(source: ControlSource) -> Self {
        Self {
            source,
            history: HistoryRing::new(CONTROL_HISTORY),
            last_ctrl_tick: None,
            last_call_tick: 0,
        }
    }

    pub fn network() -> Self {
        Self::new(ControlSource::Network)
    }

    pub fn scripted(script: impl ControlScript + 'static) -> Self {
        Self::new(ControlSource::Scripted(Box::new(script)))
    }

    pub fn is_scripted(&self) -> bool {
        matches!(self.source, ControlSource::Scripted(_))
    }

    /// Client tick of the last control returned by [`get_controls`](Self::get_controls)
    pub fn last_tick(&self) -> Option<Tick> {
        self.last_ctrl_tick
    }

    /// Stores a control that carries no snapshot acknowledgement
    pub fn register_control(&mut self, control: Control) -> bool {
        self.register(PacedControl {
            control,
            seen_snapshot: None,
        })
    }

    /// Stores a received control frame along with the snapshot it acknowledges
    pub fn register_frame(&mut self, frame: &ControlFrame) -> bool {
        self.register(PacedControl {
            control: frame.control,
            seen_snapshot: Some(frame.last_snapshot),
        })
    }

    /// A tick already held is kept as is
    fn register(&mut self, entry: PacedControl) -> bool {
        let tick = entry.control.tick;
        if self.history.mem(tick) {
            warn!("control {} already exists (discarded)", tick);
            return false;
        }
        self.history.write(tick, entry);
        true
    }

    /// Lets a scripted source produce its control for this server tick
    pub fn update(&mut self, entity: &EntityDesc, current_tick: Tick) {
        if let ControlSource::Scripted(script) = &mut self.source {
            let mut control = script.produce_control(entity, current_tick);
            control.tick = current_tick;
            self.register_control(control);
        }
    }

    /// Fills `ack` with the ticks currently held, newest first
    pub fn make_ack(&self, ack: &mut [u8]) {
        self.history.make_ack(ack);
    }

    /// Controls to apply at server tick `current_tick`, oldest first
    ///
    /// The first delivery returns the oldest control held. Afterwards, each
    /// call walks forward from the last returned tick, at most one control
    /// per server tick elapsed since the last delivery. A second call within
    /// the same server tick returns nothing.
    pub fn get_controls(&mut self, current_tick: Tick) -> Vec<PacedControl> {
        let mut res = Vec::new();

        let last_ctrl_tick = match self.last_ctrl_tick {
            Some(tick) => tick,
            None => {
                let first = self
                    .history
                    .oldest_id()
                    .and_then(|oldest| self.next_control(oldest));
                if let Some(entry) = first {
                    self.last_ctrl_tick = Some(entry.control.tick);
                    self.last_call_tick = current_tick;
                    res.push(entry);
                }
                return res;
            }
        };

        if current_tick > self.last_call_tick {
            let n_ticks = current_tick - self.last_call_tick;

            let mut aux = last_ctrl_tick;
            for _ in 0..n_ticks {
                let next = match aux.checked_add(1).and_then(|from| self.next_control(from)) {
                    Some(entry) => entry,
                    None => break,
                };
                aux = next.control.tick;
                res.push(next);
            }
            self.last_ctrl_tick = Some(aux);
        }

        if !res.is_empty() {
            self.last_call_tick = current_tick;
        }

        res
    }

    /// First control held at or after `from`
    fn next_control(&self, from: Tick) -> Option<PacedControl> {
        let head = self.history.head_id()?;
        if from > head {
            return None;
        }

        let mut tick = match self.history.oldest_id() {
            Some(oldest) => from.max(oldest),
            None => from,
        };
        while !self.history.mem(tick) && tick < head {
            tick += 1;
        }
        self.history.get_by_id(tick).copied()
    }
}
