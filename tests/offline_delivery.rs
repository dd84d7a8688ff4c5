use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::Utc;
use fleetbeacon_lib::{
    db::Database,
    error::SinkError,
    models::{GeoPoint, Reading},
    producer::{ConnectivityWatcher, Delivery, DurableQueue, ReachabilityEvent, RemoteSink, RetryPolicy, Uplink},
    settings::ConnectivitySettings,
};
use futures_util::future::BoxFuture;
use tempfile::tempdir;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
struct FlakySink {
    online: AtomicBool,
    delivered: Mutex<Vec<Uuid>>,
}

impl RemoteSink for FlakySink {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if !self.online.load(Ordering::SeqCst) {
                return Err(SinkError::Transport("no route to host".into()));
            }
            self.delivered.lock().unwrap().push(reading.id);
            Ok(())
        })
    }
}

#[tokio::test]
async fn offline_readings_are_drained_in_order_after_reconnect() {
    let dir = tempdir().expect("tempdir");
    let db = Database::new(dir.path().join("producer.sqlite3")).expect("db");
    let sink = Arc::new(FlakySink::default());
    let uplink = Arc::new(Uplink::new(
        sink.clone(),
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
    ));
    let queue = Arc::new(DurableQueue::new(db, uplink));

    let readings: Vec<Reading> = (0..3)
        .map(|i| {
            Reading::new(
                "dev-1",
                Some("Truck 7".into()),
                Some("Lan".into()),
                GeoPoint::new(10.77 + i as f64 * 0.001, 106.70),
                Utc::now(),
            )
        })
        .collect();

    for reading in &readings {
        assert_eq!(
            queue.deliver_or_enqueue(reading).await.expect("deliver"),
            Delivery::Queued
        );
    }
    assert_eq!(queue.pending_count().await.expect("count"), 3);

    let (events_tx, events_rx) = mpsc::channel(8);
    let mut watcher = ConnectivityWatcher::spawn(
        events_rx,
        queue.clone(),
        &ConnectivitySettings {
            debounce_ms: 200,
            settle_delay_ms: 20,
            probe_interval_ms: 1000,
        },
    );

    sink.online.store(true, Ordering::SeqCst);
    events_tx.send(ReachabilityEvent::Lost).await.expect("send");
    events_tx.send(ReachabilityEvent::Available).await.expect("send");
    // Inside the debounce window: must not trigger a second drain.
    events_tx.send(ReachabilityEvent::Available).await.expect("send");

    let mut pending = u64::MAX;
    for _ in 0..100 {
        pending = queue.pending_count().await.expect("count");
        if pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pending, 0);

    let expected: Vec<Uuid> = readings.iter().map(|r| r.id).collect();
    assert_eq!(*sink.delivered.lock().unwrap(), expected);

    watcher.stop().await;
}
