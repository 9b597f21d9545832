//! The telemetry wire protocol.
//!
//! Frame layout:
//!
//! ```text
//! [0x00][id][overhead][len][payload ...][crc8]
//! ```
//!
//! Bytes `2..4+len` are COBS-stuffed so the only zero on the wire is the
//! leading delimiter. The stuffed zeros form a chain of markers, each holding
//! the distance to the next one. The last marker either lands on the checksum
//! byte (the checksum was zero and is sent as `1`) or one past the end of the
//! frame (the checksum is sent as is).

use std::fmt;

use snafu::Snafu;

use crate::constants::{FRAME_DELIMITER, FRAME_OVERHEAD, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
use crate::crc;

const MARKER_START: usize = 2;
const LEN_INDEX: usize = 3;
const PAYLOAD_START: usize = 4;

/// Errors raised while building or decoding a frame.
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum FrameError {
    #[snafu(display("Invalid message id {id:#04x}, id 0 is reserved"))]
    InvalidId { id: u8 },
    #[snafu(display("Payload of {len} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit"))]
    PayloadTooLong { len: usize },
    #[snafu(display("Invalid frame length {len}, should be between {FRAME_OVERHEAD} and {MAX_FRAME_LEN}"))]
    InvalidLength { len: usize },
    #[snafu(display("Missing frame delimiter, got {byte:#04x}"))]
    MissingDelimiter { byte: u8 },
    #[snafu(display("Broken COBS chain: zero jump at byte {pos}"))]
    BrokenChain { pos: usize },
    #[snafu(display("Crc checksum mismatch: residue {residue:#04x}"))]
    ChecksumMismatch { residue: u8 },
    #[snafu(display("Length byte {declared} does not match a {actual} byte payload"))]
    LengthMismatch { declared: u8, actual: usize },
}

/// One COBS marker: a stuffed zero at `pos` pointing `jump` bytes ahead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
    pub pos: usize,
    pub jump: usize,
}

impl Marker {
    pub fn target(&self) -> usize {
        self.pos + self.jump
    }
}

/// Walks the marker chain of a stuffed frame, starting at byte 2 and stopping
/// once the next marker would be at or beyond `end`.
///
/// A zero jump is yielded once and ends the walk; callers treat it as
/// corruption.
pub struct MarkerChain<'a> {
    buf: &'a [u8],
    next: usize,
    end: usize,
    broken: bool,
}

impl<'a> MarkerChain<'a> {
    pub fn new(buf: &'a [u8], end: usize) -> Self {
        Self {
            buf,
            next: MARKER_START,
            end: end.min(buf.len()),
            broken: false,
        }
    }
}

impl Iterator for MarkerChain<'_> {
    type Item = Marker;

    fn next(&mut self) -> Option<Marker> {
        if self.broken || self.next >= self.end {
            return None;
        }

        let marker = Marker {
            pos: self.next,
            jump: self.buf[self.next] as usize,
        };
        if marker.jump == 0 {
            self.broken = true;
        } else {
            self.next = marker.target();
        }
        Some(marker)
    }
}

/// Logical unit handed to the codec.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Message {
            id,
            payload: payload.into(),
        }
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::encode(self.id, &self.payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({:#04x})[{}]", self.id, hex::encode(&self.payload))
    }
}

/// A complete frame as it travels on the wire.
#[derive(Clone, Copy)]
pub struct Frame {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Frame {
    const fn empty() -> Frame {
        Frame {
            buf: [0u8; MAX_FRAME_LEN],
            len: 0,
        }
    }

    /// Builds a frame carrying `payload` under message id `id`.
    pub fn encode(id: u8, payload: &[u8]) -> Result<Frame, FrameError> {
        if id == 0 {
            return Err(FrameError::InvalidId { id });
        }
        let len = payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong { len });
        }

        let mut frame = Frame::empty();
        frame.len = len + FRAME_OVERHEAD;

        let buf = &mut frame.buf;
        buf[0] = FRAME_DELIMITER;
        buf[1] = id;
        buf[LEN_INDEX] = len as u8;
        buf[PAYLOAD_START..PAYLOAD_START + len].copy_from_slice(payload);

        let last_marker = MARKER_START + stuff(&mut buf[MARKER_START..PAYLOAD_START + len]);

        let checksum_pos = PAYLOAD_START + len;
        match crc::crc8(&buf[..checksum_pos]) {
            // Sent as a stuffed zero: the last marker already lands on it
            0 => buf[checksum_pos] = 1,
            checksum => {
                buf[checksum_pos] = checksum;
                buf[last_marker] += 1;
            }
        }

        Ok(frame)
    }

    /// Copies a received frame. `raw` must include the leading delimiter.
    pub fn from_bytes(raw: &[u8]) -> Result<Frame, FrameError> {
        if !(FRAME_OVERHEAD..=MAX_FRAME_LEN).contains(&raw.len()) {
            return Err(FrameError::InvalidLength { len: raw.len() });
        }
        if raw[0] != FRAME_DELIMITER {
            return Err(FrameError::MissingDelimiter { byte: raw[0] });
        }

        let mut frame = Frame::empty();
        frame.buf[..raw.len()].copy_from_slice(raw);
        frame.len = raw.len();
        Ok(frame)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn message_id(&self) -> u8 {
        self.buf[1]
    }

    pub fn markers(&self) -> MarkerChain<'_> {
        MarkerChain::new(self.as_slice(), self.len)
    }

    /// Undoes the checksum compensation and checks the crc. Modifies the frame.
    pub fn verify(&mut self) -> bool {
        verify(&mut self.buf[..self.len])
    }

    /// Restores the stuffed zeros and returns the message. Expects a verified frame.
    pub fn extract(&mut self) -> Result<Message, FrameError> {
        extract(&mut self.buf[..self.len])
    }

    /// Verifies and extracts in one step.
    pub fn decode(mut self) -> Result<Message, FrameError> {
        if !self.verify() {
            return Err(FrameError::ChecksumMismatch {
                residue: crc::crc8(self.as_slice()),
            });
        }
        self.extract()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame[{}]", hex::encode(self.as_slice()))
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Frame {}

/// COBS-stuffs `range` in place; its first byte is the overhead byte.
/// Returns the index of the last marker, which points one past the range.
fn stuff(range: &mut [u8]) -> usize {
    let n = range.len();
    let mut last = 0;
    range[0] = n as u8;

    for i in 1..n {
        if range[i] == 0 {
            range[last] = (i - last) as u8;
            last = i;
            range[i] = (n - i) as u8;
        }
    }

    last
}

/// Encodes `payload` into a standalone frame.
pub fn encode(payload: &[u8], id: u8) -> Result<Frame, FrameError> {
    Frame::encode(id, payload)
}

/// Verifies a raw frame in place.
///
/// A marker landing on the checksum byte means the checksum was zero, so that
/// byte is zeroed. A marker jumping past the end carries the encode-time `+1`
/// and is decremented back. The crc over the whole frame must then be zero.
pub fn verify(frame: &mut [u8]) -> bool {
    let n = frame.len();
    if n < FRAME_OVERHEAD || frame[0] != FRAME_DELIMITER {
        return false;
    }

    let mut checksum_stuffed = false;
    let mut overshoot = None;
    for marker in MarkerChain::new(frame, n) {
        if marker.jump == 0 {
            return false;
        }
        if marker.target() == n - 1 {
            checksum_stuffed = true;
            break;
        }
        if marker.target() >= n {
            overshoot = Some(marker.pos);
        }
    }

    if let Some(pos) = overshoot {
        frame[pos] -= 1;
    }
    if checksum_stuffed {
        frame[n - 1] = 0;
    }

    crc::verify(frame)
}

/// Zero-writes every marker of a verified frame and copies out the payload.
pub fn extract(frame: &mut [u8]) -> Result<Message, FrameError> {
    let n = frame.len();
    if n < FRAME_OVERHEAD {
        return Err(FrameError::InvalidLength { len: n });
    }

    let id = frame[1];
    if id == 0 {
        return Err(FrameError::InvalidId { id });
    }

    let mut markers = Vec::new();
    for marker in MarkerChain::new(frame, n - 1) {
        if marker.jump == 0 {
            return Err(FrameError::BrokenChain { pos: marker.pos });
        }
        markers.push(marker.pos);
    }
    for pos in markers {
        frame[pos] = 0;
    }

    let payload = &frame[PAYLOAD_START..n - 1];
    if frame[LEN_INDEX] as usize != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared: frame[LEN_INDEX],
            actual: payload.len(),
        });
    }

    Ok(Message {
        id,
        payload: payload.to_vec(),
    })
}
