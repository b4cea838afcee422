//! Framing for the TruckDuck serial bridge.
//!
//! The bridge is a byte pipe, so frames travel in a small envelope: a start marker, a
//! length byte, the frame bytes, and an XOR checksum over length and frame bytes. The
//! parser tolerates noise and truncated envelopes by scanning forward to the next start
//! marker whenever a checksum fails.

/// Start-of-envelope marker.
pub const START: u8 = 0xA5;

fn xor_checksum(len: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(len, |acc, &b| acc ^ b)
}

/// Wrap frame bytes in an envelope.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u8::MAX as usize);
    let len = payload.len() as u8;

    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(START);
    out.push(len);
    out.extend_from_slice(payload);
    out.push(xor_checksum(len, payload));
    out
}

/// Incremental envelope parser. Feed it raw serial bytes with [`push`](Self::push) and
/// drain complete frames with [`next_frame`](Self::next_frame).
#[derive(Default)]
pub struct EnvelopeParser {
    buffer: Vec<u8>,
}

impl EnvelopeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete, checksum-valid frame, or `None` if the buffer holds no complete
    /// envelope yet. Bytes before a start marker and envelopes with a bad checksum are
    /// discarded, resynchronizing on the following start marker.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = self.buffer.iter().position(|&b| b == START)?;
            if start > 0 {
                self.buffer.drain(..start);
            }

            if self.buffer.len() < 3 {
                return None;
            }

            let len = self.buffer[1] as usize;
            let total = len + 3;
            if self.buffer.len() < total {
                // A corrupted length byte could make us wait forever, but the next
                // envelope's start marker resolves that on the following push
                return None;
            }

            let payload = self.buffer[2..2 + len].to_vec();
            let valid = xor_checksum(len as u8, &payload) == self.buffer[total - 1];

            if valid {
                self.buffer.drain(..total);
                return Some(payload);
            }

            // Bad checksum: skip this start marker and rescan
            self.buffer.drain(..1);
        }
    }
}
