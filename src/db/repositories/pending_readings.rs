use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{conversion_error, parse_datetime, to_u32},
};
use crate::models::{GeoPoint, QueuedItem, Reading};

impl Database {
    /// Appends a reading to the pending queue. Returns `false` when the same
    /// reading id is already queued.
    pub async fn insert_pending_reading(
        &self,
        reading: &Reading,
        enqueued_at: DateTime<Utc>,
    ) -> Result<bool> {
        let record = reading.clone();
        self.execute(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO pending_readings (
                        reading_id,
                        device_id,
                        title,
                        display_name,
                        latitude,
                        longitude,
                        captured_at,
                        enqueued_at,
                        attempts
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
                    params![
                        record.id.to_string(),
                        record.device_id,
                        record.title,
                        record.display_name,
                        record.position.lat,
                        record.position.lon,
                        record.captured_at.to_rfc3339(),
                        enqueued_at.to_rfc3339(),
                    ],
                )
                .with_context(|| "failed to insert pending reading")?;
            Ok(inserted == 1)
        })
        .await
    }

    /// Oldest first, starting after `after_id`.
    pub async fn list_pending_readings(&self, after_id: i64, limit: usize) -> Result<Vec<QueuedItem>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT
                    id,
                    reading_id,
                    device_id,
                    title,
                    display_name,
                    latitude,
                    longitude,
                    captured_at,
                    enqueued_at,
                    attempts
                FROM pending_readings
                WHERE id > ?1
                ORDER BY id ASC
                LIMIT ?2",
            )?;

            let items_iter = stmt.query_map(params![after_id, limit as i64], |row| {
                let queue_id: i64 = row.get(0)?;
                let reading_id: String = row.get(1)?;
                let device_id: String = row.get(2)?;
                let title: Option<String> = row.get(3)?;
                let display_name: Option<String> = row.get(4)?;
                let latitude: f64 = row.get(5)?;
                let longitude: f64 = row.get(6)?;
                let captured_at: String = row.get(7)?;
                let enqueued_at: String = row.get(8)?;
                let attempts: i64 = row.get(9)?;

                let id = Uuid::parse_str(&reading_id)
                    .map_err(|e| conversion_error(anyhow::Error::new(e)))?;
                let captured_at =
                    parse_datetime(&captured_at, "captured_at").map_err(conversion_error)?;
                let enqueued_at =
                    parse_datetime(&enqueued_at, "enqueued_at").map_err(conversion_error)?;
                let attempts = to_u32(attempts, "attempts").map_err(conversion_error)?;

                Ok(QueuedItem {
                    queue_id,
                    reading: Reading {
                        id,
                        device_id,
                        title,
                        display_name,
                        position: GeoPoint::new(latitude, longitude),
                        captured_at,
                    },
                    enqueued_at,
                    attempts,
                })
            })?;

            let mut items = Vec::new();
            for item in items_iter {
                items.push(item?);
            }
            Ok(items)
        })
        .await
    }

    pub async fn delete_pending_reading(&self, queue_id: i64) -> Result<bool> {
        self.execute(move |conn| {
            let removed = conn
                .execute("DELETE FROM pending_readings WHERE id = ?1", params![queue_id])
                .with_context(|| format!("failed to delete pending reading {queue_id}"))?;
            Ok(removed == 1)
        })
        .await
    }

    pub async fn record_pending_attempt(&self, queue_id: i64) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE pending_readings SET attempts = attempts + 1 WHERE id = ?1",
                params![queue_id],
            )
            .with_context(|| format!("failed to bump attempts for pending reading {queue_id}"))?;
            Ok(())
        })
        .await
    }

    pub async fn count_pending_readings(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM pending_readings", [], |row| row.get(0))
                .with_context(|| "failed to count pending readings")?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}
