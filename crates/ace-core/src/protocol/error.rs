//! Protocol errors

use thiserror::Error;

use super::RequestId;

/// Errors raised by the transport and the wire codec
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Failure reported by the serial driver
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Operation needs an open port
    #[error("Not connected to device")]
    NotConnected,

    /// Every open attempt failed
    #[error("Connection failed after {attempts} attempts")]
    ConnectionFailed {
        /// Attempts made
        attempts: u32,
    },

    /// Port missing, or no hub detected
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Bad sync bytes or a misplaced terminator
    #[error("Framing error: {0}")]
    Framing(String),

    /// Payload CRC does not match the trailer
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// CRC computed over the payload
        expected: u16,
        /// CRC carried in the frame
        actual: u16,
    },

    /// Fewer bytes than the header declares
    #[error("Incomplete message: expected {expected} bytes, got {actual}")]
    IncompleteMessage {
        /// Full frame length
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Declared or encoded payload above the maximum
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Request could not be serialized
    #[error("Payload encoding error: {0}")]
    Encoding(String),

    /// I/O failure while reading or writing the port
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Outcome delivered to a request's continuation when no usable response arrived
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Dropped unsent because the outbound queue overflowed
    #[error("Queue overflow")]
    QueueOverflow,

    /// No response within the response timeout
    #[error("Request {id} timed out")]
    Timeout {
        /// Id of the request that timed out
        id: RequestId,
    },

    /// Request could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Device answered with a nonzero code
    #[error("ACE error {code}: {msg}")]
    Application {
        /// Device error code
        code: i64,
        /// Device error message
        msg: String,
    },
}
