//! Resend schedule for initiator transactions.
//!
//! Delays grow exponentially from `min_delay_ms`, capped at `max_delay_ms`.
//! There is no jitter: resends are driven by the stack's clock, and tests
//! rely on exact timings.

use raet_types::config::RetryConfig;

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Compute the delay after a given send (0-indexed).
///
/// Formula: `min(min_delay * 2^attempt, max_delay)`
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    base.min(config.max_delay_ms)
}

// ---------------------------------------------------------------------------
// Redo timer
// ---------------------------------------------------------------------------

/// What a transaction should do when its redo timer is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoAction {
    /// Nothing is due yet.
    Wait,
    /// Resend the last packet(s).
    Resend,
    /// All sends are used up and the last interval elapsed.
    Exhausted,
}

/// Tracks sends made so far and when the next one is due.
#[derive(Debug, Clone)]
pub struct Redo {
    config: RetryConfig,
    sends: u32,
    next_at: u64,
    unlimited: bool,
}

impl Redo {
    /// Start the schedule after the first send at `now`.
    pub fn start(config: &RetryConfig, now: u64) -> Self {
        Self {
            config: config.clone(),
            sends: 1,
            next_at: now + compute_backoff(config, 0),
            unlimited: false,
        }
    }

    /// Resend every `max_delay_ms` with no attempt limit. The owning
    /// transaction's expiry bounds it instead.
    pub fn polling(config: &RetryConfig, now: u64) -> Self {
        Self {
            config: config.clone(),
            sends: 1,
            next_at: now + config.max_delay_ms,
            unlimited: true,
        }
    }

    /// Number of sends made so far.
    pub fn sends(&self) -> u32 {
        self.sends
    }

    /// Time the next check fires.
    pub fn next_at(&self) -> u64 {
        self.next_at
    }

    /// Check the timer. A `Resend` result counts as a send.
    pub fn check(&mut self, now: u64) -> RedoAction {
        if now < self.next_at {
            return RedoAction::Wait;
        }
        if self.unlimited {
            self.sends = self.sends.saturating_add(1);
            self.next_at = now + self.config.max_delay_ms;
            return RedoAction::Resend;
        }
        if self.sends >= self.config.max_attempts {
            return RedoAction::Exhausted;
        }
        self.next_at = now + compute_backoff(&self.config, self.sends);
        self.sends += 1;
        RedoAction::Resend
    }
}
