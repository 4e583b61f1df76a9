use std::time::Duration;

/// Tunables for reconnection and presence broadcast.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay before the first reconnect attempt; doubles on each failure.
    pub reconnect_base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub reconnect_max_delay: Duration,
    /// Consecutive failures tolerated before the supervisor gives up. The
    /// attempt that reaches this count transitions the session to `Failed`.
    pub max_reconnect_attempts: u32,
    /// Quiet period after the last local state change before the presence
    /// payload is broadcast; rapid toggles collapse into one write.
    pub announce_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            announce_debounce: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    /// Backoff delay for the given 1-based failure count:
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(10);
        let base_ms = self.reconnect_base_delay.as_millis() as u64;
        let max_ms = self.reconnect_max_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exp).min(max_ms);
        Duration::from_millis(delay_ms)
    }
}
