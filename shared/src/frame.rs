//! Binary message framing for the low-latency channel
//!
//! Every message on the wire is `[opcode: u8][length: u16][payload: length bytes]`.
//! Several frames may be coalesced into a single datagram; [`split_burst`]
//! walks such a burst frame by frame and stops at the first frame whose
//! declared length overruns the bytes actually received.
//!
//! Small frames live in an inline buffer. Appending past it migrates the
//! content to the heap, doubling capacity on every growth so that building a
//! frame field by field stays amortised O(1). Offsets into the frame stay
//! valid across growth; borrowed slices obviously do not.

use crate::PeerId;
use thiserror::Error;

/// Size of the inline buffer, header included
pub const INLINE_CAPACITY: usize = 128;

/// Opcode (1 byte) + payload length (2 bytes)
pub const HEADER_SIZE: usize = 3;

/// Largest payload the length field can declare
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest frame on the wire; receive buffers smaller than this truncate snapshots
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame header needs {HEADER_SIZE} bytes, only {available} available")]
    ShortHeader { available: usize },

    #[error("frame declares {declared} payload bytes, only {available} available")]
    Truncated { declared: usize, available: usize },

    #[error("payload of {requested} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    TooLarge { requested: usize },

    #[error("payload ended after {offset} bytes, {wanted} more expected")]
    UnexpectedEnd { offset: usize, wanted: usize },
}

#[derive(Clone)]
enum Buffer {
    Inline([u8; INLINE_CAPACITY]),
    Heap(Vec<u8>),
}

/// A single framed message
///
/// `sender` is only ever set by the receiving transport; frames built
/// locally for sending leave it empty.
#[derive(Clone)]
pub struct WireFrame {
    sender: Option<PeerId>,
    buffer: Buffer,
    capacity: usize,
}

impl WireFrame {
    /// Creates an empty frame with the given opcode
    pub fn new(opcode: u8) -> Self {
        let mut bytes = [0u8; INLINE_CAPACITY];
        bytes[0] = opcode;
        Self {
            sender: None,
            buffer: Buffer::Inline(bytes),
            capacity: INLINE_CAPACITY,
        }
    }

    /// Creates an empty frame able to hold `payload_len` bytes without growing
    pub fn with_capacity(opcode: u8, payload_len: usize) -> Result<Self, FrameError> {
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge {
                requested: payload_len,
            });
        }

        let mut frame = Self::new(opcode);
        let needed = HEADER_SIZE + payload_len;
        if needed > INLINE_CAPACITY {
            let mut heap = Vec::with_capacity(needed);
            heap.extend_from_slice(&[opcode, 0, 0]);
            frame.buffer = Buffer::Heap(heap);
            frame.capacity = needed;
        }
        Ok(frame)
    }

    /// Builds a frame around an existing payload
    pub fn from_payload(opcode: u8, payload: &[u8]) -> Result<Self, FrameError> {
        let mut frame = Self::with_capacity(opcode, payload.len())?;
        frame.append(payload)?;
        Ok(frame)
    }

    /// Decodes the first frame found at the start of `bytes`
    ///
    /// Fails if the header is incomplete or the declared payload length
    /// exceeds what is available. A zero-length payload is a valid frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let total = peek_total_size(bytes)?;
        let mut frame = Self::with_capacity(bytes[0], total - HEADER_SIZE)?;
        frame.append(&bytes[HEADER_SIZE..total])?;
        Ok(frame)
    }

    pub fn opcode(&self) -> u8 {
        self.header()[0]
    }

    pub fn set_opcode(&mut self, opcode: u8) {
        self.header_mut()[0] = opcode;
    }

    pub fn sender(&self) -> Option<PeerId> {
        self.sender
    }

    /// Stamps the frame with the id of the peer it was received from
    pub fn set_sender(&mut self, sender: PeerId) {
        self.sender = Some(sender);
    }

    pub fn payload_len(&self) -> usize {
        let header = self.header();
        u16::from_le_bytes([header[1], header[2]]) as usize
    }

    /// Header plus payload
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Bytes currently reserved for this frame, header included
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True while the frame still fits in its inline buffer
    pub fn is_inline(&self) -> bool {
        matches!(self.buffer, Buffer::Inline(_))
    }

    pub fn payload(&self) -> &[u8] {
        &self.as_bytes()[HEADER_SIZE..]
    }

    /// The encoded frame, ready to be written to a socket
    pub fn as_bytes(&self) -> &[u8] {
        let total = self.total_size();
        match &self.buffer {
            Buffer::Inline(bytes) => &bytes[..total],
            Buffer::Heap(bytes) => &bytes[..total],
        }
    }

    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader::new(self.payload())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        let size = self.payload_len();
        let new_size = size + bytes.len();
        if new_size > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge {
                requested: new_size,
            });
        }

        let needed = HEADER_SIZE + new_size;
        if needed > self.capacity {
            self.grow(2 * needed);
        }

        let start = HEADER_SIZE + size;
        match &mut self.buffer {
            Buffer::Inline(inline) => inline[start..needed].copy_from_slice(bytes),
            Buffer::Heap(heap) => {
                heap.truncate(start);
                heap.extend_from_slice(bytes);
            }
        }

        let len = (new_size as u16).to_le_bytes();
        let header = self.header_mut();
        header[1] = len[0];
        header[2] = len[1];
        Ok(())
    }

    pub fn append_u8(&mut self, value: u8) -> Result<(), FrameError> {
        self.append(&[value])
    }

    pub fn append_u16(&mut self, value: u16) -> Result<(), FrameError> {
        self.append(&value.to_le_bytes())
    }

    pub fn append_u32(&mut self, value: u32) -> Result<(), FrameError> {
        self.append(&value.to_le_bytes())
    }

    pub fn append_i32(&mut self, value: i32) -> Result<(), FrameError> {
        self.append(&value.to_le_bytes())
    }

    pub fn append_f32(&mut self, value: f32) -> Result<(), FrameError> {
        self.append(&value.to_le_bytes())
    }

    /// Appends a NUL-terminated string
    pub fn append_str(&mut self, value: &str) -> Result<(), FrameError> {
        self.append(value.as_bytes())?;
        self.append_u8(0)
    }

    /// Overwrites four bytes at a payload offset written earlier
    ///
    /// Used for counts that are only known once the entries following them
    /// have been appended.
    pub fn patch_u32(&mut self, offset: usize, value: u32) -> Result<(), FrameError> {
        let size = self.payload_len();
        if offset + 4 > size {
            return Err(FrameError::UnexpectedEnd {
                offset,
                wanted: offset + 4 - size,
            });
        }
        let start = HEADER_SIZE + offset;
        let bytes = value.to_le_bytes();
        match &mut self.buffer {
            Buffer::Inline(inline) => inline[start..start + 4].copy_from_slice(&bytes),
            Buffer::Heap(heap) => heap[start..start + 4].copy_from_slice(&bytes),
        }
        Ok(())
    }

    fn grow(&mut self, new_capacity: usize) {
        let total = self.total_size();
        let migrated = match &mut self.buffer {
            Buffer::Inline(inline) => {
                let mut heap = Vec::with_capacity(new_capacity);
                heap.extend_from_slice(&inline[..total]);
                Some(heap)
            }
            Buffer::Heap(heap) => {
                heap.reserve_exact(new_capacity - heap.len());
                None
            }
        };
        if let Some(heap) = migrated {
            self.buffer = Buffer::Heap(heap);
        }
        self.capacity = new_capacity;
    }

    fn header(&self) -> &[u8] {
        match &self.buffer {
            Buffer::Inline(bytes) => &bytes[..HEADER_SIZE],
            Buffer::Heap(bytes) => &bytes[..HEADER_SIZE],
        }
    }

    fn header_mut(&mut self) -> &mut [u8] {
        match &mut self.buffer {
            Buffer::Inline(bytes) => &mut bytes[..HEADER_SIZE],
            Buffer::Heap(bytes) => &mut bytes[..HEADER_SIZE],
        }
    }
}

impl std::fmt::Debug for WireFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireFrame")
            .field("opcode", &self.opcode())
            .field("payload_len", &self.payload_len())
            .field("sender", &self.sender)
            .field("inline", &self.is_inline())
            .finish()
    }
}

/// Total size (header included) of the frame at the start of `bytes`,
/// checked against the bytes available
pub fn peek_total_size(bytes: &[u8]) -> Result<usize, FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::ShortHeader {
            available: bytes.len(),
        });
    }

    let declared = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    let available = bytes.len() - HEADER_SIZE;
    if declared > available {
        return Err(FrameError::Truncated {
            declared,
            available,
        });
    }

    Ok(HEADER_SIZE + declared)
}

/// Iterates over the frames coalesced in one received burst
///
/// Yields `Err` at most once, for the first malformed or partial frame, and
/// then stops: the rest of the burst is never interpreted.
pub fn split_burst(bytes: &[u8]) -> BurstFrames<'_> {
    BurstFrames {
        bytes,
        offset: 0,
        failed: false,
    }
}

pub struct BurstFrames<'a> {
    bytes: &'a [u8],
    offset: usize,
    failed: bool,
}

impl BurstFrames<'_> {
    /// Bytes consumed by the frames yielded so far
    pub fn consumed(&self) -> usize {
        self.offset
    }
}

impl Iterator for BurstFrames<'_> {
    type Item = Result<WireFrame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.bytes.len() {
            return None;
        }

        let rest = &self.bytes[self.offset..];
        match WireFrame::decode(rest) {
            Ok(frame) => {
                self.offset += frame.total_size();
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Sequential little-endian reader over a frame payload
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < len {
            return Err(FrameError::UnexpectedEnd {
                offset: self.offset,
                wanted: len - self.remaining(),
            });
        }
        let bytes = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, FrameError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, FrameError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Reads a NUL-terminated string, replacing invalid UTF-8
    pub fn read_str(&mut self) -> Result<String, FrameError> {
        let rest = &self.bytes[self.offset..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(FrameError::UnexpectedEnd {
                offset: self.offset,
                wanted: 1,
            })?;
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.offset += end + 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_frame() {
        let frame = WireFrame::new(42);
        assert_eq!(frame.opcode(), 42);
        assert_eq!(frame.payload_len(), 0);
        assert_eq!(frame.total_size(), HEADER_SIZE);
        assert_eq!(frame.sender(), None);
        assert!(frame.is_inline());
    }

    #[test]
    fn test_append_fields() {
        let mut frame = WireFrame::new(7);
        frame.append_u8(1).unwrap();
        frame.append_u16(0x0203).unwrap();
        frame.append_u32(0xdeadbeef).unwrap();
        frame.append_f32(1.5).unwrap();
        frame.append_str("bob").unwrap();

        assert_eq!(frame.payload_len(), 1 + 2 + 4 + 4 + 4);

        let mut reader = frame.reader();
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_u16().unwrap(), 0x0203);
        assert_eq!(reader.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.read_str().unwrap(), "bob");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_large_payload_migrates_to_heap() {
        let payload: Vec<u8> = (0..130u32).map(|i| (i * 7) as u8).collect();

        let mut frame = WireFrame::new(100);
        frame.append(&payload[..60]).unwrap();
        assert!(frame.is_inline());
        frame.append(&payload[60..]).unwrap();
        assert!(!frame.is_inline());
        assert!(frame.capacity() >= frame.total_size());
        assert_eq!(frame.payload(), &payload[..]);

        let decoded = WireFrame::decode(frame.as_bytes()).unwrap();
        assert_eq!(decoded.opcode(), 100);
        assert_eq!(decoded.payload(), &payload[..]);
    }

    #[test]
    fn test_growth_doubles_capacity() {
        let mut frame = WireFrame::new(1);
        frame.append(&[0u8; 200]).unwrap();
        assert_eq!(frame.capacity(), 2 * (HEADER_SIZE + 200));

        // fits in the doubled buffer, no further growth
        frame.append(&[0u8; 100]).unwrap();
        assert_eq!(frame.capacity(), 2 * (HEADER_SIZE + 200));
    }

    #[test]
    fn test_preallocated_frame() {
        let frame = WireFrame::with_capacity(3, 10_000).unwrap();
        assert!(!frame.is_inline());
        assert!(frame.capacity() >= HEADER_SIZE + 10_000);
        assert_eq!(frame.payload_len(), 0);
    }

    #[test]
    fn test_payload_size_limit() {
        assert_eq!(
            WireFrame::with_capacity(3, MAX_PAYLOAD_SIZE + 1).unwrap_err(),
            FrameError::TooLarge {
                requested: MAX_PAYLOAD_SIZE + 1
            }
        );

        let mut frame = WireFrame::new(3);
        frame.append(&vec![0u8; MAX_PAYLOAD_SIZE]).unwrap();
        assert!(frame.append_u8(1).is_err());
        assert_eq!(frame.payload_len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_decode_truncated() {
        let mut frame = WireFrame::new(5);
        frame.append(&[1, 2, 3, 4]).unwrap();
        let bytes = frame.as_bytes();

        let err = WireFrame::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                declared: 4,
                available: 3
            }
        );

        let err = WireFrame::decode(&bytes[..2]).unwrap_err();
        assert_eq!(err, FrameError::ShortHeader { available: 2 });
    }

    #[test]
    fn test_decode_empty_payload_is_success() {
        let frame = WireFrame::decode(&[9, 0, 0]).unwrap();
        assert_eq!(frame.opcode(), 9);
        assert_eq!(frame.payload_len(), 0);
    }

    #[test]
    fn test_split_burst_with_trailing_partial() {
        let mut a = WireFrame::new(1);
        a.append_u32(11).unwrap();
        let b = WireFrame::new(2);
        let mut c = WireFrame::new(3);
        c.append(&[0u8; 8]).unwrap();

        let mut burst = Vec::new();
        burst.extend_from_slice(a.as_bytes());
        burst.extend_from_slice(b.as_bytes());
        burst.extend_from_slice(&c.as_bytes()[..6]);

        let mut frames = split_burst(&burst);
        assert_eq!(frames.next().unwrap().unwrap().opcode(), 1);
        assert_eq!(frames.next().unwrap().unwrap().opcode(), 2);
        assert!(matches!(
            frames.next(),
            Some(Err(FrameError::Truncated { .. }))
        ));
        assert!(frames.next().is_none());
        assert_eq!(frames.consumed(), a.total_size() + b.total_size());
    }

    #[test]
    fn test_patch_u32() {
        let mut frame = WireFrame::new(1);
        frame.append_u32(0).unwrap();
        frame.append_u8(9).unwrap();
        frame.patch_u32(0, 3).unwrap();
        assert!(frame.patch_u32(2, 3).is_err());

        let mut reader = frame.reader();
        assert_eq!(reader.read_u32().unwrap(), 3);
        assert_eq!(reader.read_u8().unwrap(), 9);
    }

    #[test]
    fn test_reader_unexpected_end() {
        let mut reader = FrameReader::new(&[1, 2]);
        assert_eq!(
            reader.read_u32().unwrap_err(),
            FrameError::UnexpectedEnd {
                offset: 0,
                wanted: 2
            }
        );
        assert!(FrameReader::new(b"no terminator").read_str().is_err());
    }
}
