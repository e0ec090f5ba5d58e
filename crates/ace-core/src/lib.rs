//! # ACE Core Library
//!
//! Host-side link for ACE multi-slot filament hubs.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The framed JSON wire protocol and its CRC-16 checksum
//! - Request/response correlation with per-request timeouts
//! - Connection supervision with automatic reconnect
//! - A locally mirrored device status, kept fresh by adaptive polling
//! - Park-to-toolhead and tool-change sequencing
//!
//! ## Supported devices
//!
//! - Anycubic ACE Pro
//! - BunnyAce / DuckAce clones
//!
//! ## Example
//!
//! ```rust,ignore
//! use ace_core::prelude::*;
//!
//! let config = AceConfig::from_file("ace.json")?;
//! let transport = serial_transport(&config)?;
//! let device = AceDevice::new(
//!     config,
//!     Box::new(transport),
//!     Box::new(LogNotifier),
//!     TokioTimers::new(TokioClock),
//! )?;
//!
//! let (ace, _task) = ace_core::runtime::spawn(device);
//! ace.change_tool(Some(2)).await?;
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod scheduler;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AceConfig, ConfigError};
    pub use crate::device::status::{DeviceState, DeviceStatus, Slot, SlotState};
    pub use crate::device::{serial_transport, AceDevice, ConnectionState, HostCallback};
    pub use crate::error::AceError;
    pub use crate::notify::{LogNotifier, Notification, Notifier};
    pub use crate::protocol::{Command, Reply, RequestError, Response, Transport};
    pub use crate::registry::DeviceRegistry;
    pub use crate::runtime::{AceHandle, TokioTimers};
    pub use crate::scheduler::{Scheduler, TimerQueue, TokioClock};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
