//! Tool-change sequencing
//!
//! A change runs as: unwind the outgoing slot, let it settle, wait for the
//! outgoing slot to report `ready` again, then park the incoming slot. The
//! device drives the phases from timer events; this module only holds the
//! state and the timing rules.

use std::fmt;
use std::time::{Duration, Instant};

/// Extra dwell after the computed unwind time
const UNWIND_MARGIN: Duration = Duration::from_millis(100);

/// Fixed settle after the unwind
const SETTLE_DWELL: Duration = Duration::from_secs(1);

/// What started the change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Host tool change: unwind the old slot, then park the new one
    ToolChange,
    /// Infinity spool advance: park the next slot without unwinding
    InfinitySpool,
}

/// Where a tool change currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    /// Unwind sent, waiting out the settle duration
    Settling,
    /// Polling until the vacated slot reports ready
    WaitingForSlot {
        /// When the wait began
        since: Instant,
    },
    /// Park of the incoming slot running
    Parking,
}

/// An in-progress tool change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolChange {
    /// Outgoing slot, `None` when nothing was loaded
    pub from: Option<u8>,
    /// Incoming slot, `None` to unload
    pub to: Option<u8>,
    /// What started the change
    pub kind: ChangeKind,
    /// Current step
    pub phase: ChangePhase,
}

impl ToolChange {
    /// Host tool change, starting with the unwind
    pub fn new(from: Option<u8>, to: Option<u8>) -> Self {
        Self {
            from,
            to,
            kind: ChangeKind::ToolChange,
            phase: ChangePhase::Settling,
        }
    }

    /// Infinity spool advance, starting directly with the park
    pub fn infinity_spool(from: Option<u8>, to: u8) -> Self {
        Self {
            from,
            to: Some(to),
            kind: ChangeKind::InfinitySpool,
            phase: ChangePhase::Parking,
        }
    }

    /// Whether the outgoing slot is unwound first
    pub fn unwinds(&self) -> bool {
        self.kind == ChangeKind::ToolChange && self.from.is_some()
    }

    /// Wait bound reached; the park proceeds regardless
    pub fn wait_expired(&self, now: Instant, bound: Duration) -> bool {
        match self.phase {
            ChangePhase::WaitingForSlot { since } => now.saturating_duration_since(since) >= bound,
            _ => false,
        }
    }
}

impl fmt::Display for ToolChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", DisplaySlot(self.from), DisplaySlot(self.to))
    }
}

/// Slot number, or -1 for no tool
pub struct DisplaySlot(pub Option<u8>);

impl fmt::Display for DisplaySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(slot) => write!(f, "{slot}"),
            None => write!(f, "-1"),
        }
    }
}

/// Time to wait after sending the unwind before touching the next slot
///
/// `length / speed` seconds of motion plus a fixed margin and settle dwell.
pub fn settle_duration(retract_length: u32, retract_speed: u32) -> Duration {
    let motion = if retract_speed == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(f64::from(retract_length) / f64::from(retract_speed))
    };
    motion + UNWIND_MARGIN + SETTLE_DWELL
}
