//! Packet encoding/decoding
//!
//! Packet format:
//! - 2 bytes: sync `0xFF 0xAA`
//! - 2 bytes: payload length (little-endian)
//! - N bytes: payload (UTF-8 JSON)
//! - 2 bytes: CRC16 of the payload only (little-endian)
//! - 1 byte: terminator `0xFE`

use byteorder::{ByteOrder, LittleEndian};
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    ProtocolError, Request, FRAME_OVERHEAD, MAX_INCOMPLETE_FRAMES, MAX_PAYLOAD_SIZE, SYNC,
    TERMINATOR,
};

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet payload
    pub payload: Vec<u8>,
    /// CRC16 of the payload
    pub crc: u16,
}

impl Packet {
    /// Create a new packet with the given payload
    pub fn new(payload: Vec<u8>) -> Self {
        let crc = crc16(&payload);
        Self { payload, crc }
    }

    /// Decode one complete frame (sync through terminator)
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(ProtocolError::IncompleteMessage {
                expected: FRAME_OVERHEAD,
                actual: data.len(),
            });
        }
        if data[0..2] != SYNC {
            return Err(ProtocolError::Framing(format!(
                "bad sync {:02x} {:02x}",
                data[0], data[1]
            )));
        }

        let length = LittleEndian::read_u16(&data[2..4]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(length));
        }

        let expected = length + FRAME_OVERHEAD;
        if data.len() < expected {
            return Err(ProtocolError::IncompleteMessage {
                expected,
                actual: data.len(),
            });
        }
        if data[expected - 1] != TERMINATOR {
            return Err(ProtocolError::Framing(format!(
                "missing terminator at offset {}",
                expected - 1
            )));
        }

        let payload = data[4..4 + length].to_vec();
        let received_crc = LittleEndian::read_u16(&data[4 + length..6 + length]);
        let expected_crc = crc16(&payload);
        if received_crc != expected_crc {
            return Err(ProtocolError::ChecksumMismatch {
                expected: expected_crc,
                actual: received_crc,
            });
        }

        Ok(Self {
            payload,
            crc: received_crc,
        })
    }

    /// Encode the packet to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.extend_from_slice(&SYNC);

        let mut len_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut len_bytes, self.payload.len() as u16);
        bytes.extend_from_slice(&len_bytes);

        bytes.extend_from_slice(&self.payload);

        let mut crc_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut crc_bytes, self.crc);
        bytes.extend_from_slice(&crc_bytes);

        bytes.push(TERMINATOR);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }
}

/// Serialize a request and wrap it in a frame
pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        serde_json::to_vec(request).map_err(|e| ProtocolError::Encoding(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    Ok(Packet::new(payload).to_bytes())
}

/// CRC-16 used by the ACE firmware (reflected, poly 0x8408, init 0xFFFF, no final xor)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        let mut d = (byte as u16) ^ (crc & 0xFF);
        d ^= (d & 0x0F) << 4;
        crc = ((d << 8) | (crc >> 8)) ^ (d >> 4) ^ (d << 3);
    }
    crc
}

/// Result of feeding bytes into a [`FrameDecoder`]
#[derive(Debug, Default)]
pub struct DecodeOutput {
    /// Decoded payloads, in the order they appeared in the stream
    pub frames: Vec<Value>,
    /// Messages dropped for bad framing, CRC or JSON
    pub dropped: usize,
    /// Too many consecutive incomplete frames; the link should be reset
    pub reset_required: bool,
}

/// Reassembles frames from a noisy, partially delivered byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Offset from which the next terminator search starts
    scan_pos: usize,
    incomplete_count: u32,
}

enum Candidate {
    /// Bytes before `resync` cannot start a frame
    Garbage { resync: usize },
    /// Header not fully known yet, or declared frame longer than the slice
    Incomplete { expected: usize },
    /// Slice is exactly one declared frame
    Complete,
    /// Declared length is impossible or the terminator is missing where declared
    Malformed,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and extract every complete frame now available
    pub fn feed(&mut self, data: &[u8]) -> DecodeOutput {
        self.buffer.extend_from_slice(data);
        let mut out = DecodeOutput::default();

        loop {
            self.scan_terminators(&mut out);
            match overrun(&self.buffer) {
                Some(Candidate::Garbage { resync }) => {
                    warn!(bytes = resync, "discarding unterminated garbage");
                    self.buffer.drain(..resync);
                    self.scan_pos = 0;
                }
                Some(_) => {
                    warn!(
                        buffered = self.buffer.len(),
                        "no terminator where the header declared one, resynchronising"
                    );
                    self.buffer.drain(..SYNC.len());
                    self.scan_pos = 0;
                    out.dropped += 1;
                }
                None => break,
            }
        }

        out
    }

    fn scan_terminators(&mut self, out: &mut DecodeOutput) {
        while let Some(rel) = self.buffer[self.scan_pos..]
            .iter()
            .position(|&b| b == TERMINATOR)
        {
            let end = self.scan_pos + rel;
            match classify(&self.buffer[..=end]) {
                Candidate::Garbage { resync } => {
                    debug!(bytes = resync, "discarding unframed bytes");
                    self.buffer.drain(..resync);
                    self.scan_pos = 0;
                }
                Candidate::Incomplete { expected } => {
                    self.incomplete_count += 1;
                    debug!(
                        expected,
                        actual = end + 1,
                        count = self.incomplete_count,
                        "incomplete message"
                    );
                    if self.incomplete_count > MAX_INCOMPLETE_FRAMES {
                        warn!("too many incomplete messages, connection needs a reset");
                        out.reset_required = true;
                        self.incomplete_count = 0;
                    }
                    self.scan_pos = end + 1;
                }
                Candidate::Complete => {
                    self.incomplete_count = 0;
                    let frame: Vec<u8> = self.buffer.drain(..=end).collect();
                    self.scan_pos = 0;
                    match decode_frame(&frame) {
                        Some(value) => out.frames.push(value),
                        None => out.dropped += 1,
                    }
                }
                Candidate::Malformed => {
                    debug!("malformed frame header, resynchronising");
                    self.buffer.drain(..SYNC.len());
                    self.scan_pos = 0;
                    out.dropped += 1;
                }
            }
        }
    }

    /// Get the number of buffered bytes
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes and counters
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan_pos = 0;
        self.incomplete_count = 0;
    }
}

fn classify(slice: &[u8]) -> Candidate {
    let aligned = match slice.len() {
        0 => true,
        1 => slice[0] == SYNC[0],
        _ => slice[0..2] == SYNC,
    };
    if !aligned {
        let resync = slice
            .windows(2)
            .skip(1)
            .position(|w| w == SYNC)
            .map(|p| p + 1)
            .unwrap_or(slice.len());
        return Candidate::Garbage { resync };
    }
    if slice.len() < 4 {
        return Candidate::Incomplete {
            expected: FRAME_OVERHEAD,
        };
    }

    let length = LittleEndian::read_u16(&slice[2..4]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Candidate::Malformed;
    }
    let expected = length + FRAME_OVERHEAD;
    match slice.len().cmp(&expected) {
        std::cmp::Ordering::Less => Candidate::Incomplete { expected },
        std::cmp::Ordering::Equal => Candidate::Complete,
        std::cmp::Ordering::Greater => Candidate::Malformed,
    }
}

/// Classify the unterminated tail left after a scan
///
/// Every terminator has been examined at this point, so an aligned buffer at
/// least as long as its declared frame cannot complete. Unaligned bytes are
/// only dropped once they exceed the largest possible frame.
fn overrun(buffer: &[u8]) -> Option<Candidate> {
    match classify(buffer) {
        Candidate::Garbage { resync } if buffer.len() > MAX_PAYLOAD_SIZE + FRAME_OVERHEAD => {
            Some(Candidate::Garbage { resync })
        }
        Candidate::Garbage { .. } | Candidate::Incomplete { .. } => None,
        other => Some(other),
    }
}

fn decode_frame(frame: &[u8]) -> Option<Value> {
    let packet = match Packet::from_bytes(frame) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("dropping frame: {e}");
            return None;
        }
    };
    match serde_json::from_slice(&packet.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                "JSON decode error: {e} (payload: {})",
                String::from_utf8_lossy(&packet.payload)
            );
            None
        }
    }
}
