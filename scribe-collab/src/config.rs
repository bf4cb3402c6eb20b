//! Tunable timing constants for the collaboration core.
//!
//! Three families of timeouts interact:
//!
//! - heartbeat interval: how often a lock holder refreshes its claim
//! - stale lock timeout: how long before an unrefreshed claim is reclaimable
//! - ephemeral TTL: how long cursor/drag/hover entries survive without refresh
//!
//! They must satisfy `ephemeral_ttl < 2 * heartbeat_interval < stale_lock_timeout`
//! so that a single missed heartbeat never frees a lock, while abandoned
//! cursors vanish well before an abandoned lock does.

use std::time::Duration;

/// Default heartbeat interval for the edit lock (5s).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default staleness window for edit lock claims (30s = 6 missed heartbeats).
pub const STALE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TTL for ephemeral entries (cursor/drag/hover).
pub const EPHEMERAL_TTL: Duration = Duration::from_secs(4);

/// Timing configuration for a collaboration room.
///
/// All intervals are independently tunable; [`CollabConfig::validate`]
/// checks the ordering invariant between them.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Interval between edit-lock heartbeat refreshes.
    pub heartbeat_interval: Duration,
    /// Window after which an unrefreshed lock claim is considered stale.
    pub stale_lock_timeout: Duration,
    /// TTL for ephemeral entries with no refresh.
    pub ephemeral_ttl: Duration,
    /// Interval between ephemeral sweep passes.
    pub sweep_interval: Duration,
    /// Minimum delay between outgoing cursor broadcasts.
    pub cursor_throttle: Duration,
    /// Minimum delay between outgoing drag broadcasts.
    pub drag_throttle: Duration,
    /// Minimum delay between outgoing hover broadcasts.
    pub hover_throttle: Duration,
    /// Broadcast channel capacity per room (messages buffered per subscriber).
    pub channel_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            stale_lock_timeout: STALE_LOCK_TIMEOUT,
            ephemeral_ttl: EPHEMERAL_TTL,
            sweep_interval: Duration::from_secs(1),
            cursor_throttle: Duration::from_millis(50),
            drag_throttle: Duration::from_millis(50),
            hover_throttle: Duration::from_millis(100),
            channel_capacity: 256,
        }
    }
}

impl CollabConfig {
    /// Check the timeout ordering invariant:
    /// `ephemeral_ttl < 2 * heartbeat_interval < stale_lock_timeout`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let two_heartbeats = self.heartbeat_interval * 2;
        if self.ephemeral_ttl >= two_heartbeats {
            return Err(ConfigError::EphemeralTtlTooLong {
                ttl: self.ephemeral_ttl,
                limit: two_heartbeats,
            });
        }
        if two_heartbeats >= self.stale_lock_timeout {
            return Err(ConfigError::HeartbeatTooSlow {
                interval: self.heartbeat_interval,
                stale_timeout: self.stale_lock_timeout,
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }

    /// Scaled-down config for tests: same ratios, millisecond scale.
    pub fn fast() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            stale_lock_timeout: Duration::from_millis(300),
            ephemeral_ttl: Duration::from_millis(80),
            sweep_interval: Duration::from_millis(20),
            cursor_throttle: Duration::from_millis(5),
            drag_throttle: Duration::from_millis(5),
            hover_throttle: Duration::from_millis(10),
            channel_capacity: 64,
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    EphemeralTtlTooLong { ttl: Duration, limit: Duration },
    HeartbeatTooSlow { interval: Duration, stale_timeout: Duration },
    ZeroCapacity,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EphemeralTtlTooLong { ttl, limit } => write!(
                f,
                "ephemeral TTL {ttl:?} must be shorter than two heartbeat intervals ({limit:?})"
            ),
            Self::HeartbeatTooSlow { interval, stale_timeout } => write!(
                f,
                "two heartbeat intervals (2 × {interval:?}) must fit inside the stale lock timeout ({stale_timeout:?})"
            ),
            Self::ZeroCapacity => write!(f, "channel capacity must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
