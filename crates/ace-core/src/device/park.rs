//! Feed-assist parking
//!
//! Parking runs feed assist until the filament reaches the toolhead. The
//! device cannot report that directly: it says `ready` while the assist motor
//! may still be moving. Completion is inferred once the feed-assist counter
//! stays unchanged across `hit_threshold` consecutive `ready` status reports.

use std::time::Instant;

use tracing::{debug, info};

use super::status::DeviceStatus;

/// Why a park ended without reaching the toolhead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParkFailure {
    /// `start_feed_assist` was rejected or never answered
    StartRejected(String),
    /// The session exceeded the park timeout
    TimedOut,
    /// The link dropped while parking
    ConnectionLost,
}

impl std::fmt::Display for ParkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParkFailure::StartRejected(reason) => write!(f, "feed assist rejected: {reason}"),
            ParkFailure::TimedOut => write!(f, "timed out waiting for filament to park"),
            ParkFailure::ConnectionLost => write!(f, "connection lost while parking"),
        }
    }
}

/// Terminal result of one park session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParkOutcome {
    /// Feed-assist count held steady
    Completed {
        /// Parked slot
        slot: u8,
    },
    /// Session ended without parking
    Failed {
        /// Slot being parked
        slot: u8,
        /// Why it stopped
        reason: ParkFailure,
    },
}

impl ParkOutcome {
    /// Slot the session was for
    pub fn slot(&self) -> u8 {
        match self {
            ParkOutcome::Completed { slot } | ParkOutcome::Failed { slot, .. } => *slot,
        }
    }

    /// Filament reached the toolhead
    pub fn is_completed(&self) -> bool {
        matches!(self, ParkOutcome::Completed { .. })
    }
}

/// An engaged park session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkSession {
    /// Slot being parked
    pub slot: u8,
    /// When the first `ready` status was observed
    pub started_at: Instant,
    /// `feed_assist_count` from the latest status
    pub last_assist_count: i64,
    /// Consecutive polls with an unchanged count
    pub stable_hits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    /// `start_feed_assist` sent, waiting for its reply
    Starting { slot: u8 },
    Parking(ParkSession),
}

/// Single-session park state machine
#[derive(Debug)]
pub struct ParkTracker {
    phase: Phase,
    hit_threshold: u32,
}

impl ParkTracker {
    /// Tracker that completes after `hit_threshold` stable polls (at least 1)
    pub fn new(hit_threshold: u32) -> Self {
        Self {
            phase: Phase::Idle,
            hit_threshold: hit_threshold.max(1),
        }
    }

    /// Claim the tracker for `slot`; fails when a session is already running
    pub fn begin(&mut self, slot: u8) -> Result<(), u8> {
        match &self.phase {
            Phase::Idle => {
                self.phase = Phase::Starting { slot };
                Ok(())
            }
            Phase::Starting { slot: active } => Err(*active),
            Phase::Parking(session) => Err(session.slot),
        }
    }

    /// Feed assist accepted; start watching for convergence
    pub fn engage(&mut self, now: Instant, assist_count: i64) -> Option<u8> {
        let Phase::Starting { slot } = self.phase else {
            return None;
        };
        info!(slot, assist_count, "parking started");
        self.phase = Phase::Parking(ParkSession {
            slot,
            started_at: now,
            last_assist_count: assist_count,
            stable_hits: 0,
        });
        Some(slot)
    }

    /// Inspect a merged status report
    pub fn observe(&mut self, status: &DeviceStatus) -> Option<ParkOutcome> {
        let Phase::Parking(session) = &mut self.phase else {
            return None;
        };
        if !status.is_ready() {
            return None;
        }

        let count = status.feed_assist_count;
        if count != session.last_assist_count {
            debug!(
                slot = session.slot,
                from = session.last_assist_count,
                to = count,
                "feed assist still moving"
            );
            session.last_assist_count = count;
            session.stable_hits = 0;
            return None;
        }

        session.stable_hits += 1;
        debug!(slot = session.slot, hits = session.stable_hits, "stable park sample");
        if session.stable_hits < self.hit_threshold {
            return None;
        }

        let slot = session.slot;
        self.phase = Phase::Idle;
        info!(slot, "parking completed");
        Some(ParkOutcome::Completed { slot })
    }

    /// End the session, if any, with `reason`
    pub fn fail(&mut self, reason: ParkFailure) -> Option<ParkOutcome> {
        let slot = self.slot()?;
        self.phase = Phase::Idle;
        Some(ParkOutcome::Failed { slot, reason })
    }

    /// Slot of the running session
    pub fn slot(&self) -> Option<u8> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Starting { slot } => Some(*slot),
            Phase::Parking(session) => Some(session.slot),
        }
    }

    /// Running session, once feed assist is confirmed
    pub fn session(&self) -> Option<&ParkSession> {
        match &self.phase {
            Phase::Parking(session) => Some(session),
            _ => None,
        }
    }

    /// Starting or parking
    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Feed assist confirmed and counting
    pub fn is_parking(&self) -> bool {
        matches!(self.phase, Phase::Parking(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::status::DeviceState;

    fn sample(state: DeviceState, count: i64) -> DeviceStatus {
        let mut status = DeviceStatus::default();
        status.status = state;
        status.feed_assist_count = count;
        status
    }

    fn engaged(threshold: u32, count: i64) -> ParkTracker {
        let mut tracker = ParkTracker::new(threshold);
        tracker.begin(2).unwrap();
        tracker.engage(Instant::now(), count);
        tracker
    }

    #[test]
    fn test_completes_on_fifth_unchanged_sample() {
        let mut tracker = engaged(5, 5);
        for _ in 0..4 {
            assert_eq!(tracker.observe(&sample(DeviceState::Ready, 5)), None);
        }
        assert_eq!(
            tracker.observe(&sample(DeviceState::Ready, 5)),
            Some(ParkOutcome::Completed { slot: 2 })
        );
        assert!(!tracker.is_active());
        assert_eq!(tracker.observe(&sample(DeviceState::Ready, 5)), None);
    }

    #[test]
    fn test_counter_change_restarts_the_run() {
        let mut tracker = engaged(5, 5);
        assert_eq!(tracker.observe(&sample(DeviceState::Ready, 5)), None);
        assert_eq!(tracker.observe(&sample(DeviceState::Ready, 5)), None);
        assert_eq!(tracker.observe(&sample(DeviceState::Ready, 6)), None);
        for _ in 0..4 {
            assert_eq!(tracker.observe(&sample(DeviceState::Ready, 6)), None);
        }
        assert!(tracker
            .observe(&sample(DeviceState::Ready, 6))
            .is_some_and(|o| o.is_completed()));
    }

    #[test]
    fn test_busy_samples_do_not_count() {
        let mut tracker = engaged(2, 1);
        assert_eq!(tracker.observe(&sample(DeviceState::Busy, 1)), None);
        assert_eq!(tracker.observe(&sample(DeviceState::Busy, 1)), None);
        assert_eq!(tracker.session().unwrap().stable_hits, 0);
        assert_eq!(tracker.observe(&sample(DeviceState::Ready, 1)), None);
        assert!(tracker.observe(&sample(DeviceState::Ready, 1)).is_some());
    }

    #[test]
    fn test_single_session() {
        let mut tracker = ParkTracker::new(5);
        tracker.begin(0).unwrap();
        assert_eq!(tracker.begin(1), Err(0));
        tracker.engage(Instant::now(), 0);
        assert_eq!(tracker.begin(1), Err(0));
    }

    #[test]
    fn test_samples_before_engage_are_ignored() {
        let mut tracker = ParkTracker::new(1);
        tracker.begin(3).unwrap();
        assert_eq!(tracker.observe(&sample(DeviceState::Ready, 0)), None);
        assert_eq!(
            tracker.fail(ParkFailure::StartRejected("no filament".into())),
            Some(ParkOutcome::Failed {
                slot: 3,
                reason: ParkFailure::StartRejected("no filament".into())
            })
        );
        assert_eq!(tracker.fail(ParkFailure::TimedOut), None);
    }
}
