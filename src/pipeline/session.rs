// src/pipeline/session.rs
//
// Per-run counters and the end-of-run summary. The orchestrator owns the
// counters and replaces them with an updated copy after each recorded event.

use crate::types::Label;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub total_events: u64,
    pub pothole_count: u64,
    pub uncertain_count: u64,
}

impl SessionCounters {
    /// Counters after one more event reached recording with `label`.
    #[must_use]
    pub fn record(self, label: Label) -> Self {
        Self {
            total_events: self.total_events + 1,
            pothole_count: self.pothole_count + u64::from(label == Label::Pothole),
            uncertain_count: self.uncertain_count + u64::from(label == Label::Uncertain),
        }
    }

    pub fn non_pothole_count(&self) -> u64 {
        self.total_events - self.pothole_count - self.uncertain_count
    }
}

fn rate(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub total_events: u64,
    pub pothole_count: u64,
    pub uncertain_count: u64,
    pub non_pothole_count: u64,
    /// Percent of recorded events.
    pub pothole_rate: f64,
    pub uncertain_rate: f64,
    pub capture_skips: u64,
    pub elapsed_secs: f64,
}

impl SessionSummary {
    pub fn new(counters: SessionCounters, capture_skips: u64, elapsed: Duration) -> Self {
        Self {
            total_events: counters.total_events,
            pothole_count: counters.pothole_count,
            uncertain_count: counters.uncertain_count,
            non_pothole_count: counters.non_pothole_count(),
            pothole_rate: rate(counters.pothole_count, counters.total_events),
            uncertain_rate: rate(counters.uncertain_count, counters.total_events),
            capture_skips,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub fn empty(started_at: Instant) -> Self {
        Self::new(SessionCounters::default(), 0, started_at.elapsed())
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📊 Session summary")?;
        writeln!(f, "  Total events processed: {}", self.total_events)?;
        writeln!(
            f,
            "  🕳️  Potholes detected: {} ({:.1}%)",
            self.pothole_count, self.pothole_rate
        )?;
        writeln!(
            f,
            "  ❓ Uncertain: {} ({:.1}%)",
            self.uncertain_count, self.uncertain_rate
        )?;
        writeln!(f, "  ✅ Non-pothole: {}", self.non_pothole_count)?;
        writeln!(f, "  ⏭️  Capture skips: {}", self.capture_skips)?;
        write!(f, "  Run time: {:.1}s", self.elapsed_secs)
    }
}
