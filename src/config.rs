//! Session tuning parsed from environment variables.
//!
//! Every suspension point has a finite deadline. Defaults apply when a
//! variable is absent or does not parse.

use std::time::Duration;

/// Namespace joined by the demo client and served by the demo server.
pub const DEFAULT_NAMESPACE: &str = "default";

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_DECODE_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for the `Connect` / `ConnectAck` exchange.
    pub handshake_timeout: Duration,
    /// Deadline for a namespace join to be acknowledged.
    pub join_timeout: Duration,
    /// Outbound frames queued per connection before `emit` reports backpressure.
    pub write_queue_capacity: usize,
    /// Consecutive undecodable frames tolerated before the connection is closed.
    pub max_decode_errors: u32,
    /// Largest accepted inbound frame body.
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            max_decode_errors: DEFAULT_MAX_DECODE_ERRORS,
            max_frame_len: frames::MAX_FRAME_LEN,
        }
    }
}

impl SessionConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `NEFFOS_HANDSHAKE_TIMEOUT_MS`: default 10000
    /// - `NEFFOS_JOIN_TIMEOUT_MS`: default 5000
    /// - `NEFFOS_WRITE_QUEUE`: default 256
    /// - `NEFFOS_MAX_DECODE_ERRORS`: default 3
    /// - `NEFFOS_MAX_FRAME_LEN`: default 16 MiB
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let handshake_ms = parse_or(&lookup, "NEFFOS_HANDSHAKE_TIMEOUT_MS", DEFAULT_HANDSHAKE_TIMEOUT_MS);
        let join_ms = parse_or(&lookup, "NEFFOS_JOIN_TIMEOUT_MS", DEFAULT_JOIN_TIMEOUT_MS);

        Self {
            handshake_timeout: Duration::from_millis(handshake_ms),
            join_timeout: Duration::from_millis(join_ms),
            // A zero-capacity tokio channel panics.
            write_queue_capacity: parse_or(&lookup, "NEFFOS_WRITE_QUEUE", defaults.write_queue_capacity).max(1),
            max_decode_errors: parse_or(&lookup, "NEFFOS_MAX_DECODE_ERRORS", defaults.max_decode_errors).max(1),
            max_frame_len: parse_or(&lookup, "NEFFOS_MAX_FRAME_LEN", defaults.max_frame_len),
        }
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_max_decode_errors(mut self, max: u32) -> Self {
        self.max_decode_errors = max.max(1);
        self
    }

    #[must_use]
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
