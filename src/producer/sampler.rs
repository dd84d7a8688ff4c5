use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CapabilityError, FixError},
    models::{GeoPoint, Reading},
    settings::DeviceIdentity,
};

const READING_BUFFER: usize = 64;

/// One raw fix from the positioning provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub position: GeoPoint,
    pub captured_at: DateTime<Utc>,
}

/// Source of position fixes. `register` failing is fatal; `next_fix`
/// returning `Unavailable` means re-register and keep going.
pub trait PositionProvider: Send + Sync + 'static {
    fn register(&self, interval: Duration) -> Result<(), CapabilityError>;
    fn unregister(&self);
    fn next_fix(&self) -> BoxFuture<'_, Result<Fix, FixError>>;
}

/// Emits one `Reading` per tick while running.
pub struct Sampler {
    provider: Arc<dyn PositionProvider>,
    identity: DeviceIdentity,
    reregister_delay: Duration,
    handle: Option<JoinHandle<Result<(), CapabilityError>>>,
    cancel_token: Option<CancellationToken>,
}

impl Sampler {
    pub fn new(
        provider: Arc<dyn PositionProvider>,
        identity: DeviceIdentity,
        reregister_delay: Duration,
    ) -> Self {
        Self {
            provider,
            identity,
            reregister_delay,
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Registers with the provider and starts the tick loop. A registration
    /// failure is returned as a `CapabilityError` inside the `anyhow::Error`.
    pub fn start(&mut self, interval: Duration) -> Result<mpsc::Receiver<Reading>> {
        if self.handle.is_some() {
            bail!("sampler already active");
        }

        self.provider.register(interval).map_err(|err| {
            error!("Position provider registration failed: {err}");
            anyhow::Error::new(err)
        })?;
        info!(
            "Sampling {} every {}s",
            self.identity.device_id,
            interval.as_secs_f64()
        );

        let (tx, rx) = mpsc::channel(READING_BUFFER);
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sampling_loop(
            self.provider.clone(),
            self.identity.clone(),
            interval,
            self.reregister_delay,
            tx,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(rx)
    }

    /// Stops the loop. Returns the capability error if the loop had already died of one.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("sampling loop task failed to join")?
                .map_err(anyhow::Error::new)
        } else {
            Ok(())
        }
    }
}

async fn sampling_loop(
    provider: Arc<dyn PositionProvider>,
    identity: DeviceIdentity,
    interval: Duration,
    reregister_delay: Duration,
    readings: mpsc::Sender<Reading>,
    cancel_token: CancellationToken,
) -> Result<(), CapabilityError> {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel_token.cancelled() => break Ok(()),
        }

        let fix = tokio::select! {
            fix = provider.next_fix() => fix,
            _ = cancel_token.cancelled() => break Ok(()),
        };

        match fix {
            Ok(fix) if fix.position.is_valid() => {
                let reading = Reading::new(
                    identity.device_id.clone(),
                    identity.title.clone(),
                    identity.user_name.clone(),
                    fix.position,
                    fix.captured_at,
                );
                debug!(
                    "Sampled {} at ({}, {})",
                    reading.device_id, reading.position.lat, reading.position.lon
                );
                if readings.send(reading).await.is_err() {
                    info!("Reading consumer gone; sampler exiting");
                    break Ok(());
                }
            }
            Ok(fix) => {
                warn!(
                    "Discarding fix with invalid position ({}, {})",
                    fix.position.lat, fix.position.lon
                );
            }
            Err(FixError::Unavailable(reason)) => {
                warn!("Position unavailable ({reason}); re-registering provider");
                provider.unregister();
                tokio::select! {
                    _ = time::sleep(reregister_delay) => {}
                    _ = cancel_token.cancelled() => break Ok(()),
                }
                match provider.register(interval) {
                    Ok(()) => info!("Re-registered position provider"),
                    Err(CapabilityError::Registration(reason)) => {
                        warn!("Re-registration failed ({reason}); will retry on next tick");
                    }
                    Err(err) => {
                        error!("Positioning capability lost: {err}");
                        break Err(err);
                    }
                }
            }
            Err(FixError::Capability(err)) => {
                error!("Positioning capability lost: {err}");
                break Err(err);
            }
        }
    };

    provider.unregister();
    result
}
