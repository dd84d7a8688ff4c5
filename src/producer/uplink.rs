use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use log::{info, warn};

use crate::{error::SinkError, models::Reading, settings::UplinkSettings};

/// Where readings end up. Implementations report transport failures and
/// non-success responses as `SinkError`.
pub trait RemoteSink: Send + Sync {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&UplinkSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &UplinkSettings) -> Self {
        Self {
            attempts: settings.attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.initial_delay_ms)),
        }
    }

    /// Delay after the `failed_attempt`-th failure (1-based): doubles each time, capped.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Sends one reading with bounded retries.
pub struct Uplink {
    sink: Arc<dyn RemoteSink>,
    policy: RetryPolicy,
}

impl Uplink {
    pub fn new(sink: Arc<dyn RemoteSink>, policy: RetryPolicy) -> Self {
        Self { sink, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the last error once every attempt failed, or immediately on a
    /// non-retryable error.
    pub async fn send(&self, reading: &Reading) -> Result<(), SinkError> {
        if !reading.position.is_valid() {
            return Err(SinkError::Malformed(format!(
                "position ({}, {}) out of range",
                reading.position.lat, reading.position.lon
            )));
        }

        let mut attempt = 1;
        loop {
            match self.sink.deliver(reading).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(
                            "Reading {} for {} delivered on attempt {}",
                            reading.id, reading.device_id, attempt
                        );
                    }
                    return Ok(());
                }
                Err(err) if !err.is_retryable() => {
                    warn!(
                        "Reading {} for {} (captured {}) rejected permanently: {err}",
                        reading.id, reading.device_id, reading.captured_at
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "Send attempt {}/{} failed for reading {} of {} (captured {}): {err}",
                        attempt,
                        self.policy.attempts,
                        reading.id,
                        reading.device_id,
                        reading.captured_at
                    );
                    if attempt >= self.policy.attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
