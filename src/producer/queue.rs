use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use super::{connectivity::DrainTarget, uplink::Uplink};
use crate::{
    db::Database,
    error::SinkError,
    models::{QueuedItem, Reading},
};

const DRAIN_BATCH: usize = 100;

/// What happened to a freshly sampled reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    Dropped,
}

/// Readings that have not been confirmed delivered, stored in SQLite.
///
/// A row exists exactly as long as its reading is undelivered. Drains are
/// serialized; enqueues never wait for a drain.
pub struct DurableQueue {
    db: Database,
    uplink: Arc<Uplink>,
    drain_lock: Mutex<()>,
}

impl DurableQueue {
    pub fn new(db: Database, uplink: Arc<Uplink>) -> Self {
        Self {
            db,
            uplink,
            drain_lock: Mutex::new(()),
        }
    }

    pub async fn enqueue(&self, reading: &Reading) -> Result<()> {
        let inserted = self
            .db
            .insert_pending_reading(reading, Utc::now())
            .await
            .with_context(|| format!("failed to queue reading {}", reading.id))?;
        if inserted {
            info!(
                "Queued reading {} for {} (captured {})",
                reading.id, reading.device_id, reading.captured_at
            );
        } else {
            debug!("Reading {} already queued", reading.id);
        }
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.db.count_pending_readings().await
    }

    /// Redelivers queued readings oldest first and returns how many went out.
    ///
    /// Stops at the first transient failure so later readings never overtake
    /// earlier ones; that reading and everything after it stay queued.
    /// Permanently rejected readings are removed and logged.
    pub async fn drain(&self) -> Result<usize> {
        let _guard = self.drain_lock.lock().await;

        let mut delivered = 0usize;
        let mut cursor = 0i64;
        loop {
            let batch = self.db.list_pending_readings(cursor, DRAIN_BATCH).await?;
            if batch.is_empty() {
                break;
            }

            for item in batch {
                cursor = item.queue_id;
                match self.uplink.send(&item.reading).await {
                    Ok(()) => {
                        self.db
                            .delete_pending_reading(item.queue_id)
                            .await
                            .with_context(|| {
                                format!("reading {} delivered but still queued", item.reading.id)
                            })?;
                        delivered += 1;
                    }
                    Err(err) => {
                        if !self.handle_failed_replay(&item, err).await? {
                            info!("Drain paused after {delivered} deliveries");
                            return Ok(delivered);
                        }
                    }
                }
            }
        }

        if delivered > 0 {
            info!("Drain delivered {delivered} queued readings");
        }
        Ok(delivered)
    }

    /// Returns true when the drain may continue past this item.
    async fn handle_failed_replay(
        &self,
        item: &QueuedItem,
        err: SinkError,
    ) -> Result<bool> {
        if err.is_retryable() {
            self.db.record_pending_attempt(item.queue_id).await?;
            warn!(
                "Replay of reading {} for {} (captured {}, queued {}, prior attempts {}) failed: {err}",
                item.reading.id,
                item.reading.device_id,
                item.reading.captured_at,
                item.enqueued_at,
                item.attempts
            );
            return Ok(false);
        }

        error!(
            "Dropping queued reading {} for {} (captured {}): {err}",
            item.reading.id, item.reading.device_id, item.reading.captured_at
        );
        self.db.delete_pending_reading(item.queue_id).await?;
        Ok(true)
    }

    /// Sends a fresh reading; queues it once if every attempt failed.
    pub async fn deliver_or_enqueue(&self, reading: &Reading) -> Result<Delivery> {
        match self.uplink.send(reading).await {
            Ok(()) => Ok(Delivery::Sent),
            Err(err) if !err.is_retryable() => {
                error!(
                    "Dropping reading {} for {} (captured {}): {err}",
                    reading.id, reading.device_id, reading.captured_at
                );
                Ok(Delivery::Dropped)
            }
            Err(_) => {
                self.enqueue(reading).await?;
                Ok(Delivery::Queued)
            }
        }
    }
}

impl DrainTarget for DurableQueue {
    fn drain_pending(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(self.drain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::SinkError,
        models::GeoPoint,
        producer::uplink::{RemoteSink, RetryPolicy},
    };
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex as StdMutex,
        },
        time::Duration,
    };
    use tempfile::tempdir;
    use tokio::sync::Notify;
    use uuid::Uuid;

    #[derive(Default)]
    struct SwitchableSink {
        online: AtomicBool,
        reject_all: AtomicBool,
        delivered: StdMutex<Vec<Uuid>>,
    }

    impl RemoteSink for SwitchableSink {
        fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
            Box::pin(async move {
                if self.reject_all.load(Ordering::SeqCst) {
                    return Err(SinkError::Rejected { status: 422 });
                }
                if !self.online.load(Ordering::SeqCst) {
                    return Err(SinkError::Transport("network unreachable".into()));
                }
                self.delivered.lock().unwrap().push(reading.id);
                Ok(())
            })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn reading(n: u32) -> Reading {
        Reading::new(
            "dev-1",
            None,
            Some("Lan".into()),
            GeoPoint::new(10.0, 106.0 + n as f64 / 100.0),
            Utc::now(),
        )
    }

    fn queue_with(sink: Arc<dyn RemoteSink>) -> (tempfile::TempDir, DurableQueue) {
        let dir = tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("queue.sqlite3")).expect("db");
        let uplink = Arc::new(Uplink::new(sink, fast_policy()));
        (dir, DurableQueue::new(db, uplink))
    }

    #[tokio::test]
    async fn drain_on_empty_queue_is_a_noop() {
        let sink = Arc::new(SwitchableSink::default());
        let (_dir, queue) = queue_with(sink);
        assert_eq!(queue.drain().await.expect("drain"), 0);
        assert_eq!(queue.drain().await.expect("drain again"), 0);
    }

    #[tokio::test]
    async fn failed_send_queues_exactly_once() {
        let sink = Arc::new(SwitchableSink::default());
        let (_dir, queue) = queue_with(sink.clone());
        let r = reading(1);

        assert_eq!(queue.deliver_or_enqueue(&r).await.expect("deliver"), Delivery::Queued);
        assert_eq!(queue.pending_count().await.expect("count"), 1);

        // still offline: the item stays queued with one more attempt recorded
        assert_eq!(queue.drain().await.expect("drain"), 0);
        assert_eq!(queue.pending_count().await.expect("count"), 1);

        sink.online.store(true, Ordering::SeqCst);
        assert_eq!(queue.drain().await.expect("drain"), 1);
        assert_eq!(queue.pending_count().await.expect("count"), 0);
        assert_eq!(*sink.delivered.lock().unwrap(), vec![r.id]);
    }

    #[tokio::test]
    async fn successful_send_never_touches_queue() {
        let sink = Arc::new(SwitchableSink::default());
        sink.online.store(true, Ordering::SeqCst);
        let (_dir, queue) = queue_with(sink);

        assert_eq!(queue.deliver_or_enqueue(&reading(1)).await.expect("deliver"), Delivery::Sent);
        assert_eq!(queue.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn permanent_rejection_is_dropped_not_queued() {
        let sink = Arc::new(SwitchableSink::default());
        sink.reject_all.store(true, Ordering::SeqCst);
        let (_dir, queue) = queue_with(sink);

        assert_eq!(queue.deliver_or_enqueue(&reading(1)).await.expect("deliver"), Delivery::Dropped);
        assert_eq!(queue.pending_count().await.expect("count"), 0);
    }

    /// Holds the first delivery open until released.
    #[derive(Default)]
    struct GatedSink {
        passed: AtomicBool,
        entered: Notify,
        release: Notify,
        delivered: StdMutex<Vec<Uuid>>,
    }

    impl RemoteSink for GatedSink {
        fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
            Box::pin(async move {
                if !self.passed.swap(true, Ordering::SeqCst) {
                    self.entered.notify_one();
                    self.release.notified().await;
                }
                self.delivered.lock().unwrap().push(reading.id);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn enqueue_during_drain_is_delivered_once() {
        let sink = Arc::new(GatedSink::default());
        let (_dir, queue) = queue_with(sink.clone());
        let queue = Arc::new(queue);

        let mut expected = Vec::new();
        for n in 0..3 {
            let r = reading(n);
            queue.enqueue(&r).await.expect("enqueue");
            expected.push(r.id);
        }

        let draining = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.drain().await })
        };
        sink.entered.notified().await;

        // The drain is parked on the first send with its batch already read.
        let late = reading(3);
        queue.enqueue(&late).await.expect("enqueue mid-drain");
        expected.push(late.id);
        assert_eq!(queue.pending_count().await.expect("count"), 4);

        sink.release.notify_one();
        assert_eq!(draining.await.expect("join").expect("drain"), 4);
        assert_eq!(queue.drain().await.expect("second drain"), 0);

        assert_eq!(*sink.delivered.lock().unwrap(), expected);
        assert_eq!(queue.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn concurrent_drains_deliver_each_item_once() {
        let sink = Arc::new(SwitchableSink::default());
        let (_dir, queue) = queue_with(sink.clone());
        let queue = Arc::new(queue);
        for n in 0..5 {
            queue.enqueue(&reading(n)).await.expect("enqueue");
        }
        sink.online.store(true, Ordering::SeqCst);

        let (a, b) = tokio::join!(queue.drain(), queue.drain());
        assert_eq!(a.expect("drain a") + b.expect("drain b"), 5);
        assert_eq!(sink.delivered.lock().unwrap().len(), 5);
        assert_eq!(queue.pending_count().await.expect("count"), 0);
    }
}
