use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest MTU a gateway will accept from a peer or a manifest.
pub const MTU_MIN: usize = 32;
/// Largest MTU a gateway will accept.
pub const MTU_MAX: usize = 65536;

/// How many devices a single mapper instance manages at most.
pub const DEVICE_COUNT_MAX: usize = 16;
/// How many open streams a single mapper instance manages at most.
pub const STREAM_COUNT_MAX: usize = 16;

/// Runtime configuration for a reactor and its gateway.
///
/// All values are compile-time adjustable through the defaults below and
/// run-time adjustable through a JSON manifest. `validate` enforces the
/// timer ordering the liveness protocol depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmcConfig {
    /// Initial send MTU, also advertised as our receive MTU in info responses.
    pub mtu_size: usize,
    /// Initial capacity of the receive and transmit queues.
    pub queue_size_min: usize,
    /// Hard capacity bound of the receive and transmit queues; reaching it
    /// drops the in-flight message.
    pub queue_size_max: usize,
    /// Generic response timeout, seconds.
    pub message_wait_time: f32,
    /// Discard a partially received message after this much silence.
    pub message_drop_time: f32,
    /// Query a silent peer with a ping after this interval.
    pub message_ping_time: f32,
    /// Declare a silent peer unreachable after this interval.
    pub message_trip_time: f32,
}

impl Default for EmcConfig {
    fn default() -> Self {
        Self {
            mtu_size: 255,
            queue_size_min: 64,
            queue_size_max: 4096,
            message_wait_time: 8.0,
            message_drop_time: 32.0,
            message_ping_time: 128.0,
            message_trip_time: 256.0,
        }
    }
}

// The built-in defaults must satisfy the liveness constraints.
const _: () = {
    let d = 255usize;
    assert!(d >= MTU_MIN && d <= MTU_MAX);
    assert!(64 <= 4096);
    assert!(8.0 < 32.0f32);
    assert!(128.0 > 8.0f32);
    assert!(256.0 > 8.0f32);
    assert!(128.0 < 256.0 - 8.0 - 8.0f32);
};

impl EmcConfig {
    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> std::result::Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check queue bounds and the timer ordering:
    /// `wait < drop`, `wait < trip`, `wait < ping < trip - 2*wait`.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.mtu_size < MTU_MIN || self.mtu_size > MTU_MAX {
            return Err(ConfigError::MtuOutOfRange {
                mtu: self.mtu_size,
                min: MTU_MIN,
                max: MTU_MAX,
            });
        }
        if self.queue_size_min > self.queue_size_max {
            return Err(ConfigError::QueueBoundsInverted {
                min: self.queue_size_min,
                max: self.queue_size_max,
            });
        }
        if self.message_wait_time >= self.message_drop_time {
            return Err(ConfigError::WaitExceedsDrop {
                wait: self.message_wait_time,
                drop: self.message_drop_time,
            });
        }
        if self.message_trip_time <= self.message_wait_time {
            return Err(ConfigError::TripBelowWait {
                trip: self.message_trip_time,
                wait: self.message_wait_time,
            });
        }
        if self.message_ping_time <= self.message_wait_time {
            return Err(ConfigError::PingBelowWait {
                ping: self.message_ping_time,
                wait: self.message_wait_time,
            });
        }
        if self.message_ping_time >= self.message_trip_time - 2.0 * self.message_wait_time {
            return Err(ConfigError::PingTooCloseToTrip {
                ping: self.message_ping_time,
                trip: self.message_trip_time,
                wait: self.message_wait_time,
            });
        }
        Ok(())
    }

    /// The info timer fires after twice the response timeout.
    pub fn info_time(&self) -> f32 {
        2.0 * self.message_wait_time
    }
}
