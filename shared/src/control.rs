//! Client controls and the control-frame payload
//!
//! A control frame carries one control plus the client's acknowledgement
//! state:
//!
//! ```text
//! [tick: u32][last snapshot: u32][ack: ACK_SIZE bytes][packed: u8][facing angle: f32]
//! ```
//!
//! The packed byte holds `movement << 4 | weapon_code << 2 | run << 1 | shoot`,
//! where `weapon_code` is 0 for "keep the current weapon" and `n + 1` to
//! switch to weapon slot `n`.

use crate::frame::{FrameError, WireFrame};
use crate::{opcode, SnapshotId, Tick, ACK_SIZE};

pub const MOVE_UP: u8 = 0b1000;
pub const MOVE_DOWN: u8 = 0b0100;
pub const MOVE_LEFT: u8 = 0b0010;
pub const MOVE_RIGHT: u8 = 0b0001;

/// Highest weapon slot the packed byte can express
pub const MAX_WEAPON_CHANGE: u8 = 2;

/// Encoded control-frame payload size
pub const CONTROL_FRAME_SIZE: usize = 4 + 4 + ACK_SIZE + 1 + 4;

/// One client input, produced once per client tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Control {
    pub tick: Tick,
    /// Bitmask of `MOVE_*` flags
    pub movement: u8,
    /// Weapon slot to switch to, if any
    pub weapon_change: Option<u8>,
    pub run: bool,
    pub shoot: bool,
    pub facing_angle: f32,
}

impl Control {
    pub fn new(tick: Tick) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    pub fn up(&self) -> bool {
        self.movement & MOVE_UP == MOVE_UP
    }

    pub fn down(&self) -> bool {
        self.movement & MOVE_DOWN == MOVE_DOWN
    }

    pub fn left(&self) -> bool {
        self.movement & MOVE_LEFT == MOVE_LEFT
    }

    pub fn right(&self) -> bool {
        self.movement & MOVE_RIGHT == MOVE_RIGHT
    }

    fn pack(&self) -> u8 {
        let weapon_code = match self.weapon_change {
            Some(slot) => slot.min(MAX_WEAPON_CHANGE) + 1,
            None => 0,
        };
        (self.movement & 0x0f) << 4 | weapon_code << 2 | (self.run as u8) << 1 | self.shoot as u8
    }

    fn unpack(&mut self, packed: u8) {
        self.movement = packed >> 4;
        let weapon_code = (packed >> 2) & 0b11;
        self.weapon_change = weapon_code.checked_sub(1);
        self.run = (packed >> 1) & 1 == 1;
        self.shoot = packed & 1 == 1;
    }
}

/// A control as received from the network, with the sender's acknowledgements
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFrame {
    pub last_snapshot: SnapshotId,
    pub ack: [u8; ACK_SIZE],
    pub control: Control,
}

impl ControlFrame {
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let mut reader = crate::frame::FrameReader::new(payload);

        let mut control = Control::new(reader.read_u32()?);
        let last_snapshot = reader.read_u32()?;
        let ack = reader.read_array::<ACK_SIZE>()?;
        control.unpack(reader.read_u8()?);
        control.facing_angle = reader.read_f32()?;

        Ok(Self {
            last_snapshot,
            ack,
            control,
        })
    }

    pub fn encode(&self) -> Result<WireFrame, FrameError> {
        let mut frame = WireFrame::with_capacity(opcode::CONTROL_FRAME, CONTROL_FRAME_SIZE)?;
        frame.append_u32(self.control.tick)?;
        frame.append_u32(self.last_snapshot)?;
        frame.append(&self.ack)?;
        frame.append_u8(self.control.pack())?;
        frame.append_f32(self.control.facing_angle)?;
        Ok(frame)
    }
}

/// Sets bit `i` of an ack bitmap, least significant bit of byte 0 first
pub fn set_ack_bit(ack: &mut [u8], i: usize) {
    if let Some(byte) = ack.get_mut(i / 8) {
        *byte |= 1 << (i % 8);
    }
}

/// Whether bit `i` of an ack bitmap is set
///
/// Bit `i` acknowledges id `head_id - i` of the sender's history.
pub fn ack_bit(ack: &[u8], i: usize) -> bool {
    ack.get(i / 8).map_or(false, |byte| byte & (1 << (i % 8)) != 0)
}
