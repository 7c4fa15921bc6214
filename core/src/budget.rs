//! Wall-clock accounting for one code submission.
//!
//! The budget pauses while the host is deciding an approval request: time
//! between emitting the request and receiving its decision must not reduce
//! the remaining allowance. Kernel time and provider time both count.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct ExecutionBudget {
    deadline: Option<Instant>,
    paused_since: Option<Instant>,
    paused_total: Duration,
}

impl ExecutionBudget {
    pub fn new(timeout: Option<Duration>) -> Self {
        ExecutionBudget {
            deadline: timeout.map(|t| Instant::now() + t),
            paused_since: None,
            paused_total: Duration::ZERO,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    /// Marks the budget paused. Idempotent: a second pause before the first
    /// resume keeps the original pause start.
    pub fn pause(&mut self) {
        if self.paused_since.is_none() {
            self.paused_since = Some(Instant::now());
        }
    }

    /// Ends the current pause and credits its duration back.
    pub fn resume(&mut self) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total += since.elapsed();
        }
    }

    /// Remaining allowance right now; `None` means unbounded. While paused
    /// the value is frozen at what it was when the pause began.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.deadline?;
        let effective_now = self.paused_since.unwrap_or_else(Instant::now);
        let effective_deadline = deadline + self.paused_total;
        Some(effective_deadline.saturating_duration_since(effective_now))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining(), Some(Duration::ZERO))
    }
}
