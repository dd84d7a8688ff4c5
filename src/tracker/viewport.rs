use std::{
    future,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use super::display::{DisplayCommand, DisplaySink};
use crate::{models::GeoPoint, settings::ViewportSettings};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// Why the viewport is being asked to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewportReason {
    /// First event ever seen for an entity.
    New,
    Update,
    /// The user changed an entity's visibility.
    Toggle,
}

/// Read access to the positions the viewport frames.
pub trait PositionSource: Send + Sync + 'static {
    /// Visible entities that are not lost.
    fn active_positions(&self) -> Vec<GeoPoint>;
    /// Every visible entity.
    fn visible_positions(&self) -> Vec<GeoPoint>;
}

/// Center on the first point when there are at most `min_entities` of them,
/// otherwise fit their bounding box. No antimeridian handling.
pub fn plan_viewport(points: &[GeoPoint], settings: &ViewportSettings) -> Option<DisplayCommand> {
    plan(points, settings.min_entities.max(1), settings)
}

fn plan(points: &[GeoPoint], center_at_most: usize, settings: &ViewportSettings) -> Option<DisplayCommand> {
    let first = *points.first()?;
    if points.len() <= center_at_most {
        return Some(DisplayCommand::CenterOn {
            position: first,
            zoom: settings.single_entity_zoom,
        });
    }

    let (mut south_west, mut north_east) = (first, first);
    for point in &points[1..] {
        south_west.lat = south_west.lat.min(point.lat);
        south_west.lon = south_west.lon.min(point.lon);
        north_east.lat = north_east.lat.max(point.lat);
        north_east.lon = north_east.lon.max(point.lon);
    }
    Some(DisplayCommand::FitBounds {
        south_west,
        north_east,
        padding: settings.padding,
    })
}

#[derive(Debug)]
enum ViewportIntent {
    Reason(ViewportReason),
    FitAll,
    SetPolicy(ViewportSettings),
}

/// Owns the viewport debounce timer on its own task.
pub struct ViewportController {
    tx: mpsc::UnboundedSender<ViewportIntent>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl ViewportController {
    pub fn spawn(
        settings: ViewportSettings,
        source: Arc<dyn PositionSource>,
        display: Arc<dyn DisplaySink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_viewport_loop(
            rx,
            settings,
            source,
            display,
            cancel_token.clone(),
        ));

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            cancel_token,
        }
    }

    /// `new` recomputes at once. `toggle` (and `update` when enabled) waits
    /// out the debounce delay, restarting it on every further request.
    pub fn on_reason(&self, reason: ViewportReason) {
        self.send(ViewportIntent::Reason(reason));
    }

    /// Immediately frames every visible entity, lost ones included.
    pub fn fit_to_all(&self) {
        self.send(ViewportIntent::FitAll);
    }

    pub fn set_policy(&self, settings: ViewportSettings) {
        self.send(ViewportIntent::SetPolicy(settings));
    }

    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log_error!("viewport task failed to join: {err}");
            }
        }
    }

    fn send(&self, intent: ViewportIntent) {
        if self.tx.send(intent).is_err() {
            log_error!("viewport task is gone; dropping request");
        }
    }
}

async fn run_viewport_loop(
    mut rx: mpsc::UnboundedReceiver<ViewportIntent>,
    mut settings: ViewportSettings,
    source: Arc<dyn PositionSource>,
    display: Arc<dyn DisplaySink>,
    cancel_token: CancellationToken,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let pending = deadline;
        let debounce = async move {
            match pending {
                Some(at) => time::sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = debounce => {
                deadline = None;
                let points = source.active_positions();
                if let Some(command) = plan_viewport(&points, &settings) {
                    display.apply(command);
                }
            }
            intent = rx.recv() => {
                let Some(intent) = intent else { break };
                match intent {
                    ViewportIntent::Reason(ViewportReason::New) => {
                        let points = source.active_positions();
                        if let Some(command) = plan_viewport(&points, &settings) {
                            display.apply(command);
                        }
                    }
                    ViewportIntent::Reason(ViewportReason::Update) if !settings.fit_on_update => {}
                    ViewportIntent::Reason(reason) => {
                        log_info!("viewport recompute scheduled ({reason:?})");
                        deadline = Some(Instant::now() + Duration::from_millis(settings.toggle_delay_ms));
                    }
                    ViewportIntent::FitAll => {
                        let points = source.visible_positions();
                        if let Some(command) = plan(&points, 1, &settings) {
                            display.apply(command);
                        }
                    }
                    ViewportIntent::SetPolicy(next) => {
                        log_info!("viewport policy: fit_on_update={}", next.fit_on_update);
                        settings = next;
                    }
                }
            }
        }
    }
}
