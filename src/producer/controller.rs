use std::sync::Arc;

use anyhow::Result;
use log::{error, info, warn};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::task::TaskTracker;

use super::{
    connectivity::{ConnectivityWatcher, ReachabilityEvent},
    queue::{Delivery, DurableQueue},
    sampler::{PositionProvider, Sampler},
    uplink::Uplink,
};
use crate::{db::Database, settings::AppSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStatus {
    Running,
    /// Title or user name missing; nothing is sampled until both are set.
    AwaitingIdentity,
}

/// Wires sampler → uplink → queue and the reconnect drain.
pub struct ProducerController {
    settings: AppSettings,
    queue: Arc<DurableQueue>,
    sampler: Sampler,
    pump: Option<JoinHandle<()>>,
    watcher: Option<ConnectivityWatcher>,
    sends: TaskTracker,
}

impl ProducerController {
    pub fn new(
        settings: AppSettings,
        db: Database,
        uplink: Arc<Uplink>,
        provider: Arc<dyn PositionProvider>,
    ) -> Self {
        let sampler = Sampler::new(
            provider,
            settings.identity.clone(),
            settings.sampler.reregister_delay(),
        );
        Self {
            queue: Arc::new(DurableQueue::new(db, uplink)),
            sampler,
            settings,
            pump: None,
            watcher: None,
            sends: TaskTracker::new(),
        }
    }

    pub fn queue(&self) -> Arc<DurableQueue> {
        self.queue.clone()
    }

    pub async fn start(
        &mut self,
        reachability: mpsc::Receiver<ReachabilityEvent>,
    ) -> Result<ProducerStatus> {
        if !self.settings.identity.is_complete() {
            warn!(
                "Device {} has no title/user name configured; tracking paused",
                self.settings.identity.device_id
            );
            return Ok(ProducerStatus::AwaitingIdentity);
        }

        // backlog from a previous run goes out without waiting for a reconnect event
        let queue = self.queue.clone();
        self.sends.spawn(async move {
            match queue.drain().await {
                Ok(count) => info!("Startup drain delivered {count} queued readings"),
                Err(err) => error!("Startup drain failed: {err:?}"),
            }
        });

        self.watcher = Some(ConnectivityWatcher::spawn(
            reachability,
            self.queue.clone(),
            &self.settings.connectivity,
        ));

        let mut readings = self.sampler.start(self.settings.sampler.interval())?;

        let queue = self.queue.clone();
        let sends = self.sends.clone();
        self.pump = Some(tokio::spawn(async move {
            while let Some(reading) = readings.recv().await {
                let queue = queue.clone();
                // sends run beside the sampling cadence, never in front of it
                sends.spawn(async move {
                    match queue.deliver_or_enqueue(&reading).await {
                        Ok(Delivery::Sent) => info!("Sent reading {} for {}", reading.id, reading.device_id),
                        Ok(Delivery::Queued) => match queue.pending_count().await {
                            Ok(pending) => warn!("Reading {} queued; {pending} pending", reading.id),
                            Err(err) => warn!("Reading {} queued; pending count unavailable: {err}", reading.id),
                        },
                        Ok(Delivery::Dropped) => {}
                        Err(err) => error!(
                            "Reading {} for {} (captured {}) could not be sent or queued: {err:?}",
                            reading.id, reading.device_id, reading.captured_at
                        ),
                    }
                });
            }
            info!("Sampler stream ended");
        }));

        Ok(ProducerStatus::Running)
    }

    /// Resolves when the sampler stream ends on its own (fatal capability loss).
    pub async fn closed(&mut self) {
        match self.pump.as_mut() {
            Some(pump) => {
                let _ = pump.await;
                self.pump = None;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Stops sampling, waits for in-flight sends and returns the sampler's fatal error if any.
    pub async fn stop(&mut self) -> Result<()> {
        let sampler_result = self.sampler.stop().await;

        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop().await;
        }

        self.sends.close();
        self.sends.wait().await;
        self.sends.reopen();

        sampler_result
    }
}
