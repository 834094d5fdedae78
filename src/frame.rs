//! §4.2 frame scanner: a per-direction byte-stream state machine that turns
//! raw serial bytes into validated Z-Wave frames.
//!
//! A frame is `0x01 L B1 .. B_L C` where `C = 0xFF XOR L XOR B1 XOR .. XOR
//! B_L`. Between frames the stream may carry arbitrary noise (ACKs, NAKs,
//! partial garbage); [`FrameScanner::feed`] never blocks waiting for more
//! input and may be called with arbitrarily small or large chunks — state
//! survives across calls (DESIGN NOTES, "Framer reentry").

use tracing::trace;

const MAX_FRAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Len,
    Body,
}

/// One event produced while scanning a chunk, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Bytes that never formed part of a frame attempt (ACKs, NAKs, noise,
    /// or an aborted too-long length byte) — write through unchanged.
    Passthrough(Vec<u8>),
    /// A complete frame with a valid checksum, ready for rule matching.
    Frame(Vec<u8>),
    /// A complete frame-shaped byte run whose checksum failed — bypasses
    /// matching and is written through verbatim (§4.4 last line).
    BadChecksum(Vec<u8>),
}

/// Per-direction framer state. One instance per direction (send/receive);
/// the dispatcher owns a pair.
pub struct FrameScanner {
    state: State,
    frame: Vec<u8>,
    xor: u8,
    /// Noise accumulated in `Idle` state, not yet flushed.
    prefix: Vec<u8>,
    direction_label: &'static str,
}

impl FrameScanner {
    pub fn new(direction_label: &'static str) -> Self {
        FrameScanner {
            state: State::Idle,
            frame: Vec::with_capacity(MAX_FRAME_LEN),
            xor: 0xFF,
            prefix: Vec::new(),
            direction_label,
        }
    }

    /// Feed a chunk of raw bytes, returning the events produced, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        for &c in chunk {
            self.feed_byte(c, &mut events);
        }
        // End of input: flush any trailing noise only if we're not mid-frame.
        if self.state == State::Idle && !self.prefix.is_empty() {
            events.push(ScanEvent::Passthrough(std::mem::take(&mut self.prefix)));
        }
        events
    }

    fn feed_byte(&mut self, c: u8, events: &mut Vec<ScanEvent>) {
        trace!(direction = self.direction_label, state = ?self.state, byte = format!("{c:02X}"), "scanner byte");
        match self.state {
            State::Idle => {
                if c == 0x01 {
                    if !self.prefix.is_empty() {
                        events.push(ScanEvent::Passthrough(std::mem::take(&mut self.prefix)));
                    }
                    self.frame.clear();
                    self.frame.push(c);
                    self.xor = 0xFF;
                    self.state = State::Len;
                } else {
                    self.prefix.push(c);
                }
            }
            State::Len => {
                if c as usize >= MAX_FRAME_LEN {
                    // Noise: the SOF and this byte never formed a frame.
                    self.prefix.append(&mut self.frame);
                    self.prefix.push(c);
                    self.state = State::Idle;
                } else {
                    self.frame.push(c);
                    self.xor ^= c;
                    self.state = State::Body;
                }
            }
            State::Body => {
                self.frame.push(c);
                self.xor ^= c;
                let expected_len = self.frame[1] as usize + 2;
                if self.frame.len() == expected_len {
                    if self.xor == 0 {
                        events.push(ScanEvent::Frame(std::mem::take(&mut self.frame)));
                    } else {
                        events.push(ScanEvent::BadChecksum(std::mem::take(&mut self.frame)));
                    }
                    self.frame = Vec::with_capacity(MAX_FRAME_LEN);
                    self.state = State::Idle;
                }
            }
        }
    }
}
