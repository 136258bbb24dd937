use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{crypto::HmacKey, Duration};

/// Configuration of a [`TimeWaitListManager`](crate::TimeWaitListManager)
///
/// Default values match long-standing server deployments: connection IDs are retained for 200
/// seconds and at most 600,000 are tracked at once.
#[derive(Clone)]
pub struct TimeWaitConfig {
    pub(crate) time_wait_period: Duration,
    pub(crate) max_connections: Option<usize>,
    pub(crate) reset_key: Arc<dyn HmacKey>,
    pub(crate) max_pending_bytes: usize,
    pub(crate) error_log_interval: Duration,
    pub(crate) rng_seed: Option<[u8; 32]>,
}

impl TimeWaitConfig {
    /// Create a default config with a particular `reset_key`
    pub fn new(reset_key: Arc<dyn HmacKey>) -> Self {
        Self {
            time_wait_period: Duration::from_secs(200),
            max_connections: Some(600_000),
            reset_key,
            max_pending_bytes: 100_000_000,
            error_log_interval: Duration::from_secs(60),
            rng_seed: None,
        }
    }

    /// How long a connection ID stays in the time-wait list before it may be forgotten
    ///
    /// Must be non-zero.
    pub fn time_wait_period(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.is_zero() {
            return Err(ConfigError::OutOfBounds);
        }
        self.time_wait_period = value;
        Ok(self)
    }

    /// Upper bound on the number of connection IDs tracked at once
    ///
    /// When the list is full, the oldest entry is evicted to make room for a new one. `None`
    /// disables the bound. A bound of zero is rejected since no entry could ever be admitted.
    pub fn max_connections(&mut self, value: Option<usize>) -> Result<&mut Self, ConfigError> {
        if value == Some(0) {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_connections = value;
        Ok(self)
    }

    /// Private key used to derive stateless reset tokens for closed connections
    ///
    /// Must be the key the endpoint used while the connections were alive, or peers will not
    /// recognize the resets.
    pub fn reset_key(&mut self, key: Arc<dyn HmacKey>) -> &mut Self {
        self.reset_key = key;
        self
    }

    /// Maximum number of payload bytes held while the writer is blocked
    ///
    /// Replies that would exceed this are dropped. Termination replies are best-effort, so an
    /// unresponsive socket must not make the queue grow without bound.
    pub fn max_pending_bytes(&mut self, value: usize) -> &mut Self {
        self.max_pending_bytes = value;
        self
    }

    /// Minimum interval between two logged write errors
    pub fn error_log_interval(&mut self, value: Duration) -> &mut Self {
        self.error_log_interval = value;
        self
    }

    /// Seed for the random bits in generated packets
    ///
    /// Only useful for reproducible tests.
    pub fn rng_seed(&mut self, seed: Option<[u8; 32]>) -> &mut Self {
        self.rng_seed = seed;
        self
    }

    /// Get the current value of `time_wait_period`
    pub fn get_time_wait_period(&self) -> Duration {
        self.time_wait_period
    }

    /// Get the current value of `max_connections`
    pub fn get_max_connections(&self) -> Option<usize> {
        self.max_connections
    }
}

impl fmt::Debug for TimeWaitConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TimeWaitConfig")
            .field("time_wait_period", &self.time_wait_period)
            .field("max_connections", &self.max_connections)
            // reset_key not debug
            .field("max_pending_bytes", &self.max_pending_bytes)
            .field("error_log_interval", &self.error_log_interval)
            .field("rng_seed", &self.rng_seed)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "ring")]
impl Default for TimeWaitConfig {
    fn default() -> Self {
        use rand::RngCore;

        let mut reset_key = [0; 64];
        rand::rng().fill_bytes(&mut reset_key);

        Self::new(Arc::new(ring::hmac::Key::new(
            ring::hmac::HMAC_SHA256,
            &reset_key,
        )))
    }
}

/// Errors in the configuration of a time-wait list
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}
