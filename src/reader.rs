use crate::constants::{FRAME_DELIMITER, FRAME_OVERHEAD, MAX_PACKET_SIZE_TELEMETRY};
use crate::protocol::{Frame, FrameError, Message};

/// Result of feeding one byte to the reassembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// No frame in progress, the byte was dropped.
    Idle,
    /// A frame is in progress and holds this many bytes.
    Collecting(usize),
    /// A frame of this many bytes sits at the start of the buffer.
    Complete(usize),
}

/// Feeds one byte into a frame being collected in `buffer`.
///
/// `size` is the number of bytes collected so far. Every delimiter restarts
/// collection, so the stream resynchronises after any corruption. Once four
/// bytes are in, the total length is known: a first marker of 1 means the
/// length byte itself was stuffed, i.e. an empty payload.
pub fn step(byte: u8, buffer: &mut [u8], size: usize) -> Step {
    if byte == FRAME_DELIMITER {
        buffer[0] = FRAME_DELIMITER;
        return Step::Collecting(1);
    }

    if size == 0 || size >= buffer.len() {
        return Step::Idle;
    }

    buffer[size] = byte;

    if size >= 3 {
        let total = if buffer[2] == 1 {
            FRAME_OVERHEAD
        } else {
            buffer[3] as usize + FRAME_OVERHEAD
        };
        if size + 1 >= total {
            return Step::Complete(total);
        }
    }

    if size + 1 >= buffer.len() {
        // Too long for this buffer, wait for the next delimiter
        return Step::Idle;
    }

    Step::Collecting(size + 1)
}

/// Reassembles frames from an unbounded byte stream.
///
/// +------+  0x00  +------------+  len known  +----------+
/// | Idle |------->| Collecting |------------>| Complete |
/// +------+        +------------+             +----------+
///     ^                 |                          |
///     +-----------------+ overflow                 |
///     +--------------------------------------------+
///
pub struct FrameReader<const C: usize = MAX_PACKET_SIZE_TELEMETRY> {
    buf: [u8; C],
    size: usize,
}

impl<const C: usize> FrameReader<C> {
    pub const fn new() -> Self {
        Self {
            buf: [0; C],
            size: 0,
        }
    }

    /// Drops any partially collected frame.
    pub fn reset(&mut self) {
        self.size = 0;
    }

    /// Number of bytes of the frame currently being collected.
    pub fn pending(&self) -> usize {
        self.size
    }

    /// Consumes a byte and returns a complete (not yet verified) frame if one is ready.
    pub fn push_byte(&mut self, byte: u8) -> Option<Result<Frame, FrameError>> {
        match step(byte, &mut self.buf, self.size) {
            Step::Idle => {
                self.size = 0;
                None
            }
            Step::Collecting(size) => {
                self.size = size;
                None
            }
            Step::Complete(total) => {
                self.size = 0;
                Some(Frame::from_bytes(&self.buf[..total]))
            }
        }
    }

    /// Consumes bytes until a frame completes. Returns it together with the
    /// unconsumed remainder of `data`.
    pub fn push_bytes<'b>(
        &mut self,
        data: &'b [u8],
    ) -> (Option<Result<Frame, FrameError>>, &'b [u8]) {
        for (i, &byte) in data.iter().enumerate() {
            if let Some(frame) = self.push_byte(byte) {
                return (Some(frame), &data[i + 1..]);
            }
        }
        (None, &[])
    }

    /// Returns an iterator over the raw frames completed by `data`.
    pub fn iter_frames<'a, 'b>(&'a mut self, data: &'b [u8]) -> IterFrames<'a, 'b, C> {
        IterFrames { reader: self, data }
    }

    /// Returns an iterator over the decoded messages completed by `data`.
    pub fn iter_messages<'a, 'b>(&'a mut self, data: &'b [u8]) -> IterMessages<'a, 'b, C> {
        IterMessages {
            frames: self.iter_frames(data),
        }
    }
}

impl<const C: usize> Default for FrameReader<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IterFrames<'a, 'b, const C: usize> {
    reader: &'a mut FrameReader<C>,
    data: &'b [u8],
}

impl<const C: usize> Iterator for IterFrames<'_, '_, C> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let result;
        (result, self.data) = self.reader.push_bytes(self.data);
        result
    }
}

/// Yields `Ok(Message)` for each frame that verifies, `Err` for each corrupt one.
pub struct IterMessages<'a, 'b, const C: usize> {
    frames: IterFrames<'a, 'b, C>,
}

impl<const C: usize> Iterator for IterMessages<'_, '_, C> {
    type Item = Result<Message, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.frames
            .next()
            .map(|frame| frame.and_then(|frame| frame.decode()))
    }
}
