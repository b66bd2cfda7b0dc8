//! Retry policy for scheduler-driven device dispatch.

use std::time::Duration;

use tracing::warn;

use crate::clock::Clock;
use crate::device::{DeviceCommand, DeviceGateway};
use crate::error::DeviceError;

/// How many times an auto task's command is sent before the task fails.
///
/// Only `CommFailure` is retried; an unregistered device fails at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never zero.
    pub max_attempts: u32,
    /// Wait between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// A policy that sends exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn should_retry(&self, attempt: u32, err: &DeviceError) -> bool {
        attempt < self.max_attempts && matches!(err, DeviceError::CommFailure { .. })
    }

    /// Send `command`, retrying per policy. Returns the device's response or
    /// the last failure.
    pub async fn send(
        &self,
        gateway: &DeviceGateway,
        clock: &dyn Clock,
        command: &DeviceCommand,
    ) -> Result<String, DeviceError> {
        let mut attempt = 1;
        loop {
            match gateway.send_command(command).await {
                Ok(response) => return Ok(response),
                Err(err) if self.should_retry(attempt, &err) => {
                    warn!(
                        command = %command,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Device command failed, retrying"
                    );
                    clock.sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
