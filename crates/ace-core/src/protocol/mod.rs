//! Serial Protocol Communication
//!
//! Implements the ACE framed JSON protocol: `FF AA | len | payload | crc16 | FE`,
//! request/response correlation by id and the serial transport.

pub mod commands;
pub mod dispatcher;
mod error;
mod packet;
pub mod serial;

pub use commands::{Command, Reply, Request, Response};
pub use dispatcher::{Dispatcher, Outbound};
pub use error::{ProtocolError, RequestError};
pub use packet::{crc16, encode_request, DecodeOutput, FrameDecoder, Packet};
pub use serial::{find_ace_device, list_ports, PortInfo, SerialTransport, Transport};

/// Correlation id carried by every request
pub type RequestId = u32;

/// Request ids wrap back to 0 when they reach this value
pub const REQUEST_ID_MODULUS: RequestId = 300_000;

/// Default baud rate for the ACE USB serial link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Frame sync bytes
pub const SYNC: [u8; 2] = [0xFF, 0xAA];

/// Frame terminator byte
pub const TERMINATOR: u8 = 0xFE;

/// Sync + length + crc + terminator
pub const FRAME_OVERHEAD: usize = 7;

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Consecutive incomplete frames tolerated before the link is considered desynced
pub const MAX_INCOMPLETE_FRAMES: u32 = 10;
