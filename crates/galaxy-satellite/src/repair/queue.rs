//! The injured-segment repair queue.
//!
//! Backed by SQLite; insertion is keyed on `(stream_id, position)` so a
//! segment appears at most once per checker iteration, and a duplicate
//! insert only refreshes the `updated_at` stamp. After an iteration the
//! checker calls `clean` to drop entries that were not re-inserted, which
//! removes segments that have healed since they were queued.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repair_queue (
    stream_id BLOB NOT NULL,
    position INTEGER NOT NULL,
    placement INTEGER NOT NULL DEFAULT 0,
    segment_health REAL NOT NULL,
    inserted_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    attempted_at TEXT,
    PRIMARY KEY (stream_id, position)
)
"#;

/// One entry in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct InjuredSegment {
    pub stream_id: Uuid,
    pub position: u64,
    pub placement: u16,
    pub segment_health: f64,
}

pub struct RepairQueue {
    pool: SqlitePool,
}

impl RepairQueue {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
                .map_err(sqlx::Error::from)?
                .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert one injured segment. Returns whether it was newly queued;
    /// duplicates refresh `updated_at` and the health score only.
    pub async fn insert(&self, segment: &InjuredSegment, now: DateTime<Utc>) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO repair_queue
                (stream_id, position, placement, segment_health, inserted_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(segment.stream_id.as_bytes().to_vec())
        .bind(segment.position as i64)
        .bind(segment.placement as i64)
        .bind(segment.segment_health)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            sqlx::query(
                r#"
                UPDATE repair_queue SET updated_at = ?, segment_health = ?
                WHERE stream_id = ? AND position = ?
                "#,
            )
            .bind(now)
            .bind(segment.segment_health)
            .bind(segment.stream_id.as_bytes().to_vec())
            .bind(segment.position as i64)
            .execute(&self.pool)
            .await?;
        }

        Ok(inserted)
    }

    /// Worst segments first; ties broken by queue age.
    pub async fn select_n(&self, limit: i64) -> Result<Vec<InjuredSegment>> {
        let rows = sqlx::query(
            r#"
            SELECT stream_id, position, placement, segment_health
            FROM repair_queue
            ORDER BY segment_health ASC, inserted_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut segments = Vec::with_capacity(rows.len());
        for row in rows {
            let stream_id: Vec<u8> = row.try_get("stream_id")?;
            let position: i64 = row.try_get("position")?;
            let placement: i64 = row.try_get("placement")?;
            segments.push(InjuredSegment {
                stream_id: Uuid::from_slice(&stream_id).unwrap_or_default(),
                position: position as u64,
                placement: placement as u16,
                segment_health: row.try_get("segment_health")?,
            });
        }
        Ok(segments)
    }

    /// Remove entries not refreshed since `before`. Returns how many were
    /// dropped.
    pub async fn clean(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM repair_queue WHERE updated_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM repair_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

/// Buffers queue writes into fixed-size batches.
pub struct InsertBuffer {
    batch: Vec<InjuredSegment>,
    batch_size: usize,
    newly_inserted: u64,
}

impl InsertBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch: Vec::with_capacity(batch_size),
            batch_size,
            newly_inserted: 0,
        }
    }

    /// Stage one segment; flushes automatically when the batch fills.
    pub async fn insert(
        &mut self,
        queue: &RepairQueue,
        segment: InjuredSegment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.batch.push(segment);
        if self.batch.len() >= self.batch_size {
            self.flush(queue, now).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self, queue: &RepairQueue, now: DateTime<Utc>) -> Result<()> {
        for segment in self.batch.drain(..) {
            if queue.insert(&segment, now).await? {
                self.newly_inserted += 1;
            }
        }
        Ok(())
    }

    /// Segments that were new to the queue, across all flushes so far.
    pub fn newly_inserted(&self) -> u64 {
        self.newly_inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injured(id: u8, position: u64, health: f64) -> InjuredSegment {
        InjuredSegment {
            stream_id: Uuid::from_bytes([id; 16]),
            position,
            placement: 0,
            segment_health: health,
        }
    }

    #[tokio::test]
    async fn test_insert_is_at_most_once() {
        let queue = RepairQueue::open_in_memory().await.unwrap();
        let now = Utc::now();

        assert!(queue.insert(&injured(1, 0, 0.5), now).await.unwrap());
        assert!(!queue.insert(&injured(1, 0, 0.4), now).await.unwrap());
        assert_eq!(queue.count().await.unwrap(), 1);

        // the duplicate refreshed the health score
        let segments = queue.select_n(10).await.unwrap();
        assert_eq!(segments[0].segment_health, 0.4);
    }

    #[tokio::test]
    async fn test_select_orders_by_health_then_age() {
        let queue = RepairQueue::open_in_memory().await.unwrap();
        let now = Utc::now();

        queue.insert(&injured(1, 0, 0.9), now).await.unwrap();
        queue
            .insert(&injured(2, 0, 0.1), now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        queue
            .insert(&injured(3, 0, 0.1), now + chrono::Duration::seconds(2))
            .await
            .unwrap();

        let segments = queue.select_n(10).await.unwrap();
        assert_eq!(segments.len(), 3);
        // worst health first, then the older of the tied pair
        assert_eq!(segments[0].stream_id, Uuid::from_bytes([2u8; 16]));
        assert_eq!(segments[1].stream_id, Uuid::from_bytes([3u8; 16]));
        assert_eq!(segments[2].stream_id, Uuid::from_bytes([1u8; 16]));
    }

    #[tokio::test]
    async fn test_clean_removes_stale_entries() {
        let queue = RepairQueue::open_in_memory().await.unwrap();
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::hours(1);

        queue.insert(&injured(1, 0, 0.5), earlier).await.unwrap();
        queue.insert(&injured(2, 0, 0.5), earlier).await.unwrap();
        // segment 2 gets re-seen in the newer iteration
        queue.insert(&injured(2, 0, 0.5), later).await.unwrap();

        let removed = queue.clean(later).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = queue.select_n(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stream_id, Uuid::from_bytes([2u8; 16]));
    }

    #[tokio::test]
    async fn test_insert_buffer_flushes_at_batch_size() {
        let queue = RepairQueue::open_in_memory().await.unwrap();
        let now = Utc::now();
        let mut buffer = InsertBuffer::new(2);

        buffer.insert(&queue, injured(1, 0, 0.5), now).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0, "buffered, not yet written");

        buffer.insert(&queue, injured(2, 0, 0.5), now).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 2, "batch size reached");

        buffer.insert(&queue, injured(3, 0, 0.5), now).await.unwrap();
        buffer.flush(&queue, now).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 3);
        assert_eq!(buffer.newly_inserted(), 3);
    }
}
