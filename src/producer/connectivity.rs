use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::settings::ConnectivitySettings;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Network reachability transitions, as reported by the platform or a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
    Available,
    Lost,
    Unavailable,
}

/// Something that can redeliver its backlog when the network comes back.
pub trait DrainTarget: Send + Sync + 'static {
    fn drain_pending(&self) -> BoxFuture<'_, Result<usize>>;
}

/// Turns reachability events into debounced drains.
///
/// Events arrive on a channel so the notifier never runs a drain inline. An
/// `Available` within `debounce` of the last accepted one is ignored; each
/// accepted one schedules exactly one drain after `settle_delay`.
pub struct ConnectivityWatcher {
    handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl ConnectivityWatcher {
    pub fn spawn(
        events: mpsc::Receiver<ReachabilityEvent>,
        target: Arc<dyn DrainTarget>,
        settings: &ConnectivitySettings,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(watch_loop(
            events,
            target,
            Duration::from_millis(settings.debounce_ms),
            Duration::from_millis(settings.settle_delay_ms),
            cancel_token.clone(),
        ));

        Self {
            handle: Some(handle),
            cancel_token,
        }
    }

    pub async fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                log_error!("connectivity watcher failed to join: {err}");
            }
        }
    }
}

async fn watch_loop(
    mut events: mpsc::Receiver<ReachabilityEvent>,
    target: Arc<dyn DrainTarget>,
    debounce: Duration,
    settle_delay: Duration,
    cancel_token: CancellationToken,
) {
    let mut last_accepted: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    log_info!("reachability channel closed; watcher exiting");
                    break;
                };
                match event {
                    ReachabilityEvent::Available => {
                        let now = Instant::now();
                        if let Some(previous) = last_accepted {
                            if now.duration_since(previous) < debounce {
                                log_warn!("network available again within {:?}; ignoring", debounce);
                                continue;
                            }
                        }
                        last_accepted = Some(now);
                        log_info!("network available; draining queued readings in {:?}", settle_delay);
                        spawn_delayed_drain(target.clone(), settle_delay, cancel_token.child_token());
                    }
                    ReachabilityEvent::Lost => log_warn!("network connection lost"),
                    ReachabilityEvent::Unavailable => log_warn!("no network available"),
                }
            }
            _ = cancel_token.cancelled() => {
                break;
            }
        }
    }
}

fn spawn_delayed_drain(target: Arc<dyn DrainTarget>, delay: Duration, cancel_token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = cancel_token.cancelled() => return,
        }
        match target.drain_pending().await {
            Ok(count) => log_info!("reconnect drain finished; {count} readings delivered"),
            Err(err) => log_error!("reconnect drain failed: {err:?}"),
        }
    });
}

/// Emits `Available`/`Lost` on reachability changes of the sink host, found
/// with a periodic TCP connect.
pub struct ReachabilityProbe {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl ReachabilityProbe {
    pub fn spawn(
        endpoint: &str,
        interval: Duration,
        events: mpsc::Sender<ReachabilityEvent>,
    ) -> Result<Self> {
        let address = probe_address(endpoint)?;
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reachable: Option<bool> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now_reachable = matches!(
                            time::timeout(PROBE_TIMEOUT, TcpStream::connect(address.as_str())).await,
                            Ok(Ok(_))
                        );
                        if reachable == Some(now_reachable) {
                            continue;
                        }
                        reachable = Some(now_reachable);
                        let event = if now_reachable {
                            ReachabilityEvent::Available
                        } else {
                            ReachabilityEvent::Lost
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });

        Ok(Self {
            handle,
            cancel_token,
        })
    }

    pub async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.handle.await;
    }
}

fn probe_address(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint)
        .with_context(|| format!("invalid sink endpoint {endpoint}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("sink endpoint {endpoint} has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("sink endpoint {endpoint} has no port"))?;
    Ok(format!("{host}:{port}"))
}
