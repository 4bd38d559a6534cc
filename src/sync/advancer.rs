// ABOUTME: Watermark advancer - captures the resume watermark before a scan, commits after
// ABOUTME: Per-cycle state machine Idle -> WatermarkCaptured -> Scanning -> Completed

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::SyncError;
use super::token::{Clock, Watermark};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    WatermarkCaptured,
    Scanning,
    Completed,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::WatermarkCaptured => "watermark-captured",
            CyclePhase::Scanning => "scanning",
            CyclePhase::Completed => "completed",
        };
        write!(f, "{name}")
    }
}

/// Result of [`WatermarkAdvancer::capture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    /// Watermark every event of the cycle carries and the cycle commits.
    pub resume: Watermark,
    /// What the clock said. Lower than `resume` only when the clock went
    /// backwards past the committed watermark.
    pub observed: Watermark,
}

impl Capture {
    pub fn clock_regressed(&self) -> bool {
        self.observed < self.resume
    }
}

/// Tracks the committed resume point of one polling sequence.
///
/// The watermark is captured before the search is issued and committed only
/// when the scan finished without error. Anything that changes between capture
/// and commit is at or after the captured value and is picked up again by the
/// next cycle, so nothing is skipped; it may be delivered twice.
#[derive(Debug, Clone)]
pub struct WatermarkAdvancer {
    committed: Option<Watermark>,
    pending: Option<Watermark>,
    phase: CyclePhase,
}

impl Default for WatermarkAdvancer {
    fn default() -> Self {
        Self::new()
    }
}

impl WatermarkAdvancer {
    pub fn new() -> Self {
        Self::resume_from(None)
    }

    pub fn resume_from(committed: Option<Watermark>) -> Self {
        Self {
            committed,
            pending: None,
            phase: CyclePhase::Idle,
        }
    }

    pub fn committed(&self) -> Option<Watermark> {
        self.committed
    }

    pub fn pending(&self) -> Option<Watermark> {
        self.pending
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Idle/Completed -> WatermarkCaptured.
    ///
    /// The captured value never goes below the committed one, which keeps
    /// committed watermarks monotonic even if the wall clock steps back.
    pub fn capture(&mut self, clock: &impl Clock) -> Result<Capture, SyncError> {
        self.expect_phase("capture a watermark", &[CyclePhase::Idle, CyclePhase::Completed])?;
        let observed = Watermark::now(clock);
        let resume = match self.committed {
            Some(committed) if committed > observed => committed,
            _ => observed,
        };
        self.pending = Some(resume);
        self.phase = CyclePhase::WatermarkCaptured;
        Ok(Capture { resume, observed })
    }

    /// WatermarkCaptured -> Scanning.
    pub fn begin_scan(&mut self) -> Result<(), SyncError> {
        self.expect_phase("start scanning", &[CyclePhase::WatermarkCaptured])?;
        self.phase = CyclePhase::Scanning;
        Ok(())
    }

    /// Scanning -> Completed, publishing the captured watermark.
    pub fn complete(&mut self) -> Result<Watermark, SyncError> {
        self.expect_phase("commit a watermark", &[CyclePhase::Scanning])?;
        let committed = self.pending.take().ok_or(SyncError::CycleState {
            action: "commit a watermark",
            phase: self.phase,
        })?;
        self.committed = Some(committed);
        self.phase = CyclePhase::Completed;
        Ok(committed)
    }

    /// Drops the captured watermark; the committed one stays authoritative.
    pub fn abort(&mut self) {
        self.pending = None;
        self.phase = CyclePhase::Idle;
    }

    fn expect_phase(&self, action: &'static str, allowed: &[CyclePhase]) -> Result<(), SyncError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(SyncError::CycleState {
                action,
                phase: self.phase,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::token::FixedClock;
    use chrono::{TimeZone, Utc};

    fn clock() -> FixedClock {
        FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn full_cycle_commits_captured_watermark() {
        let clock = clock();
        let mut advancer = WatermarkAdvancer::new();
        assert_eq!(advancer.phase(), CyclePhase::Idle);

        let capture = advancer.capture(&clock).unwrap();
        assert_eq!(advancer.phase(), CyclePhase::WatermarkCaptured);
        // Time passing during the scan does not move the captured value.
        clock.advance_secs(30);
        advancer.begin_scan().unwrap();
        assert_eq!(advancer.phase(), CyclePhase::Scanning);
        assert_eq!(advancer.committed(), None);

        let committed = advancer.complete().unwrap();
        assert_eq!(committed, capture.resume);
        assert_eq!(committed.to_string(), "20240101000000Z");
        assert_eq!(advancer.committed(), Some(committed));
        assert_eq!(advancer.phase(), CyclePhase::Completed);
    }

    #[test]
    fn abort_keeps_previous_commit() {
        let clock = clock();
        let previous = Watermark::parse("20231231000000Z").unwrap();
        let mut advancer = WatermarkAdvancer::resume_from(Some(previous));
        advancer.capture(&clock).unwrap();
        advancer.begin_scan().unwrap();
        advancer.abort();
        assert_eq!(advancer.phase(), CyclePhase::Idle);
        assert_eq!(advancer.pending(), None);
        assert_eq!(advancer.committed(), Some(previous));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let clock = clock();
        let mut advancer = WatermarkAdvancer::new();
        assert!(matches!(
            advancer.begin_scan(),
            Err(SyncError::CycleState { phase: CyclePhase::Idle, .. })
        ));
        assert!(advancer.complete().is_err());
        advancer.capture(&clock).unwrap();
        advancer.begin_scan().unwrap();
        assert!(matches!(
            advancer.capture(&clock),
            Err(SyncError::CycleState { phase: CyclePhase::Scanning, .. })
        ));
    }

    #[test]
    fn commits_are_monotonic_across_cycles() {
        let clock = clock();
        let mut advancer = WatermarkAdvancer::new();
        let mut last = None;
        for step in [10, 0, 3600] {
            clock.advance_secs(step);
            advancer.capture(&clock).unwrap();
            advancer.begin_scan().unwrap();
            let committed = advancer.complete().unwrap();
            if let Some(last) = last {
                assert!(committed >= last);
            }
            last = Some(committed);
        }
    }

    #[test]
    fn clock_regression_keeps_committed_value() {
        let clock = clock();
        let ahead = Watermark::parse("20240101000500Z").unwrap();
        let mut advancer = WatermarkAdvancer::resume_from(Some(ahead));
        let capture = advancer.capture(&clock).unwrap();
        assert!(capture.clock_regressed());
        assert_eq!(capture.resume, ahead);
        advancer.begin_scan().unwrap();
        assert_eq!(advancer.complete().unwrap(), ahead);
    }
}
