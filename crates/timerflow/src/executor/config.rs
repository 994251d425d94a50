//! Executor configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration shared by the active and standby executors.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use timerflow::ExecutorConfig;
///
/// let config = ExecutorConfig {
///     resend_delay: Duration::from_secs(60),
///     discard_delay: Duration::from_secs(600),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Lag a standby tolerates before requesting history catch-up.
    ///
    /// Default: 15 minutes.
    pub resend_delay: Duration,

    /// Lag after which a standby abandons a task.
    ///
    /// Must be strictly greater than `resend_delay`. Default: 25 minutes.
    pub discard_delay: Duration,

    /// Attempts per delivery when the state update hits a write conflict.
    ///
    /// Default: 3.
    pub max_update_attempts: u32,

    /// Maximum wait for the per-execution lease.
    ///
    /// Default: 1 second.
    pub lease_timeout: Duration,

    /// Running executions whose state stays cached between deliveries.
    ///
    /// Default: 1024.
    pub cache_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            resend_delay: Duration::from_secs(15 * 60),
            discard_delay: Duration::from_secs(25 * 60),
            max_update_attempts: 3,
            lease_timeout: Duration::from_secs(1),
            cache_capacity: 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.discard_delay <= self.resend_delay {
            return Err(Error::InvalidConfig(format!(
                "discard_delay ({:?}) must be greater than resend_delay ({:?})",
                self.discard_delay, self.resend_delay
            )));
        }
        if self.max_update_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_update_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
