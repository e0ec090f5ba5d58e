//! Host notifications
//!
//! The device reports everything the host may want to react to (hook macros,
//! persisted variables, console output) as [`Notification`] values pushed to
//! a [`Notifier`].

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::device::toolchange::DisplaySlot;

/// Event pushed to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Link up and `get_info` answered
    Connected {
        /// Model string from `get_info`
        model: String,
        /// Firmware version from `get_info`
        firmware: String,
    },
    /// Link dropped
    Disconnected,
    /// A slot needed for the operation is not `ready`
    SlotEmpty {
        /// Slot that is not ready
        slot: u8,
    },
    /// Runs the host's pre tool change hook
    PreToolChange {
        /// Outgoing tool
        from: Option<u8>,
        /// Incoming tool
        to: Option<u8>,
    },
    /// Runs the host's post tool change hook
    PostToolChange {
        /// Outgoing tool
        from: Option<u8>,
        /// Incoming tool
        to: Option<u8>,
    },
    /// Current tool changed; the host should persist it
    ToolSelected {
        /// New current tool
        tool: Option<u8>,
    },
    /// Tool change finished with the new slot parked
    ToolChangeCompleted {
        /// Outgoing tool
        from: Option<u8>,
        /// Incoming tool
        to: Option<u8>,
    },
    /// Tool change gave up
    ToolChangeFailed {
        /// Outgoing tool
        from: Option<u8>,
        /// Incoming tool
        to: Option<u8>,
        /// Human-readable cause
        reason: String,
    },
    /// Filament reached the toolhead
    ParkCompleted {
        /// Parked slot
        slot: u8,
    },
    /// Park session ended without parking
    ParkFailed {
        /// Slot being parked
        slot: u8,
        /// Human-readable cause
        reason: String,
    },
    /// Runs the host's pre infinity spool hook
    PreInfinitySpool,
    /// Runs the host's post infinity spool hook
    PostInfinitySpool,
    /// Next infinity-spool slot; the host should persist it
    InfinitySpoolAdvanced {
        /// Slot the next advance switches to
        counter: u8,
    },
    /// Requested tool is already selected
    AlreadySelected {
        /// Current tool
        tool: Option<u8>,
    },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Connected { model, firmware } => write!(f, "Connected {model} {firmware}"),
            Notification::Disconnected => write!(f, "Disconnected"),
            Notification::SlotEmpty { slot } => write!(f, "Slot {slot} is empty"),
            Notification::PreToolChange { from, to } => {
                write!(f, "Tool change starting: {} -> {}", DisplaySlot(*from), DisplaySlot(*to))
            }
            Notification::PostToolChange { from, to } => {
                write!(f, "Tool change finishing: {} -> {}", DisplaySlot(*from), DisplaySlot(*to))
            }
            Notification::ToolSelected { tool } => write!(f, "Current tool: {}", DisplaySlot(*tool)),
            Notification::ToolChangeCompleted { from, to } => {
                write!(f, "Tool changed from {} to {}", DisplaySlot(*from), DisplaySlot(*to))
            }
            Notification::ToolChangeFailed { from, to, reason } => write!(
                f,
                "Tool change from {} to {} failed: {reason}",
                DisplaySlot(*from),
                DisplaySlot(*to)
            ),
            Notification::ParkCompleted { slot } => write!(f, "Slot {slot} parked to toolhead"),
            Notification::ParkFailed { slot, reason } => {
                write!(f, "Parking slot {slot} failed: {reason}")
            }
            Notification::PreInfinitySpool => write!(f, "Infinity spool starting"),
            Notification::PostInfinitySpool => write!(f, "Infinity spool finishing"),
            Notification::InfinitySpoolAdvanced { counter } => {
                write!(f, "Infinity spool counter: {counter}")
            }
            Notification::AlreadySelected { tool } => {
                write!(f, "Tool already set to {}", DisplaySlot(*tool))
            }
        }
    }
}

impl Notification {
    fn is_failure(&self) -> bool {
        matches!(
            self,
            Notification::SlotEmpty { .. }
                | Notification::ToolChangeFailed { .. }
                | Notification::ParkFailed { .. }
        )
    }
}

/// Receiver of host notifications
pub trait Notifier: Send {
    /// Deliver one event; must not block
    fn notify(&mut self, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, notification: Notification) {
        if notification.is_failure() {
            warn!("{notification}");
        } else {
            info!("{notification}");
        }
    }
}

impl Notifier for UnboundedSender<Notification> {
    fn notify(&mut self, notification: Notification) {
        // receiver gone means nobody is listening any more
        let _ = self.send(notification);
    }
}
