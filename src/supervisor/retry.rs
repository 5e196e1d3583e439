//! Cancellable per-service retry backoff.
//!
//! Schedule: initial delay >= `reconnectDelayMs` (default 30s), doubling on
//! each subsequent failure, capped at 300s. A successful handshake resets
//! the delay. Scheduled timers are cancelled via a `CancellationToken` so a
//! `stopService` in flight never fires a retry after the fact.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INITIAL_DELAY_MS: u64 = 30_000;
pub const MAX_DELAY_MS: u64 = 300_000;

/// Tracks the current backoff delay for one service across repeated
/// failures, and exposes a cancellable sleep for the supervisor's retry
/// loop to await.
pub struct RetryState {
    initial_delay_ms: u64,
    current_delay_ms: u64,
    attempts: u32,
    cancel: CancellationToken,
}

impl RetryState {
    pub fn new(initial_delay_ms: u64) -> Self {
        let initial_delay_ms = initial_delay_ms.max(1);
        Self {
            initial_delay_ms,
            current_delay_ms: initial_delay_ms,
            attempts: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the backoff on a successful handshake and cancel anything
    /// still pending from a previous failure cycle.
    pub fn reset(&mut self) {
        self.current_delay_ms = self.initial_delay_ms;
        self.attempts = 0;
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
    }

    /// Cancel any in-flight wait (used by `stopService`/`stopAll`).
    pub fn cancel(&mut self) {
        self.cancel.cancel();
    }

    /// Await the next backoff delay, or return `Ok(())` immediately if the
    /// wait was cancelled — callers should treat a cancelled wait as "do not
    /// retry" rather than "retry now".
    pub async fn wait_and_advance(&mut self) -> Result<(), Cancelled> {
        let delay = Duration::from_millis(self.current_delay_ms);
        self.attempts += 1;
        self.current_delay_ms = (self.current_delay_ms.saturating_mul(2)).min(MAX_DELAY_MS);

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(Cancelled),
        }
    }

    pub fn current_delay_ms(&self) -> u64 {
        self.current_delay_ms
    }
}

#[derive(Debug)]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_sequence_doubles_and_caps() {
        let mut state = RetryState::new(30_000);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(state.current_delay_ms());
            state.current_delay_ms = (state.current_delay_ms * 2).min(MAX_DELAY_MS);
        }
        assert_eq!(seen, vec![30_000, 60_000, 120_000, 240_000, 300_000, 300_000, 300_000]);
    }

    #[test]
    fn reset_restores_initial_delay_and_attempts() {
        let mut state = RetryState::new(30_000);
        state.current_delay_ms = 240_000;
        state.attempts = 4;
        state.reset();
        assert_eq!(state.current_delay_ms(), 30_000);
        assert_eq!(state.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_wait() {
        let mut state = RetryState::new(30_000);
        state.cancel();
        let result = state.wait_and_advance().await;
        assert!(result.is_err());
    }
}
