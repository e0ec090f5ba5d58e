//! Errors returned by host operations

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::{ProtocolError, RequestError};

/// Errors returned to the host by device operations
#[derive(Error, Debug)]
pub enum AceError {
    /// An argument is out of range
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// Argument name
        name: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// The slot does not report `ready`
    #[error("Slot {0} is not ready")]
    SlotNotReady(u8),

    /// A park session is already running for this slot
    #[error("Already parking slot {0} to toolhead")]
    AlreadyParking(u8),

    /// Only one tool change runs at a time
    #[error("A tool change is already in progress")]
    ToolChangeInProgress,

    /// `infinity_spool_mode` is off in the config
    #[error("Infinity spool mode is disabled")]
    InfinitySpoolDisabled,

    /// Infinity spool needs a current tool to advance from
    #[error("No tool is selected")]
    NoToolSelected,

    /// Infinity-spool counter has run past the last slot
    #[error("No more spools: counter {0} is past the last slot")]
    NoSpoolsLeft(u8),

    /// Global tool number outside every registered device
    #[error("No device handles tool {0}")]
    UnknownTool(u32),

    /// The tokio device task is gone
    #[error("Device task has stopped")]
    DeviceStopped,

    /// The link went down while the request was in flight
    #[error("Request abandoned before a reply arrived")]
    Abandoned,

    /// The device answered with an error, or never answered
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Transport or codec failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AceError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        AceError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}
