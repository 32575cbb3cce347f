//! # Network Tick Clock
//!
//! Measures every pass of the network thread.
//!
//! The thread does not run at a fixed rate: it blocks on the bus for at
//! most `tick_wait`. A tick is measured from the end of that wait, so its
//! duration is handling time only and an idle endpoint has no late ticks.

use std::time::{Duration, Instant};

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Minimum tick duration observed.
    pub min_tick_us: u64,
    /// Maximum tick duration observed.
    pub max_tick_us: u64,
    /// Average tick duration (rolling).
    pub avg_tick_us: u64,
    /// Number of ticks that overran the budget.
    pub late_ticks: u64,
    /// Total ticks measured.
    pub total_ticks: u64,
    /// Messages handled since start.
    pub messages_handled: u64,
}

/// Tick measurement for the network thread.
pub struct TickClock {
    budget: Duration,
    stats: TickStats,
}

impl TickClock {
    /// Creates a clock flagging ticks longer than `budget` as late.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            stats: TickStats {
                min_tick_us: u64::MAX,
                ..TickStats::default()
            },
        }
    }

    /// Marks the start of a tick.
    #[must_use]
    pub fn begin_tick(&self) -> Instant {
        Instant::now()
    }

    /// Marks the end of a tick that handled `messages` messages.
    pub fn end_tick(&mut self, start: Instant, messages: u64) {
        let duration = start.elapsed();
        let duration_us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        self.stats.total_ticks += 1;
        self.stats.messages_handled += messages;
        self.stats.min_tick_us = self.stats.min_tick_us.min(duration_us);
        self.stats.max_tick_us = self.stats.max_tick_us.max(duration_us);

        // Rolling average
        self.stats.avg_tick_us = if self.stats.total_ticks == 1 {
            duration_us
        } else {
            (self.stats.avg_tick_us * 15 + duration_us) / 16
        };

        if duration > self.budget {
            self.stats.late_ticks += 1;
        }
    }

    /// Returns tick statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Returns the tick budget.
    #[must_use]
    pub const fn budget(&self) -> Duration {
        self.budget
    }
}
