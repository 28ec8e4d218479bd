//! Per-node transfer queue for graceful exit.

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use galaxy_core::NodeId;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS graceful_exit_transfers (
    node_id BLOB NOT NULL,
    stream_id BLOB NOT NULL,
    position INTEGER NOT NULL,
    piece_number INTEGER NOT NULL,
    queued_at TEXT NOT NULL,
    completed_at TEXT,
    failed_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (node_id, stream_id, position)
)
"#;

/// One piece an exiting node must hand off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub node_id: NodeId,
    pub stream_id: Uuid,
    pub position: u64,
    pub piece_number: u16,
}

/// Progress totals for one exiting node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub pieces_transferred: u64,
    pub pieces_failed: u64,
}

pub struct TransferQueue {
    pool: SqlitePool,
}

impl TransferQueue {
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

    /// Queue transfer items for a node; duplicates are ignored so repeated
    /// loop passes do not double-queue.
    pub async fn enqueue(&self, node: NodeId, items: &[TransferItem]) -> Result<()> {
        let now = Utc::now();
        for item in items {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO graceful_exit_transfers
                    (node_id, stream_id, position, piece_number, queued_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(node.to_vec())
            .bind(item.stream_id.as_bytes().to_vec())
            .bind(item.position as i64)
            .bind(item.piece_number as i64)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Incomplete transfer items for a node, oldest first.
    pub async fn incomplete(&self, node: NodeId, limit: i64) -> Result<Vec<TransferItem>> {
        let rows = sqlx::query(
            r#"
            SELECT stream_id, position, piece_number
            FROM graceful_exit_transfers
            WHERE node_id = ? AND completed_at IS NULL
            ORDER BY queued_at
            LIMIT ?
            "#,
        )
        .bind(node.to_vec())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let stream_id: Vec<u8> = row.try_get("stream_id")?;
            let position: i64 = row.try_get("position")?;
            let piece_number: i64 = row.try_get("piece_number")?;
            items.push(TransferItem {
                node_id: node,
                stream_id: Uuid::from_slice(&stream_id).unwrap_or_default(),
                position: position as u64,
                piece_number: piece_number as u16,
            });
        }
        Ok(items)
    }

    pub async fn incomplete_count(&self, node: NodeId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM graceful_exit_transfers WHERE node_id = ? AND completed_at IS NULL",
        )
        .bind(node.to_vec())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn mark_transferred(&self, item: &TransferItem) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE graceful_exit_transfers SET completed_at = ?
            WHERE node_id = ? AND stream_id = ? AND position = ?
            "#,
        )
        .bind(Utc::now())
        .bind(item.node_id.to_vec())
        .bind(item.stream_id.as_bytes().to_vec())
        .bind(item.position as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, item: &TransferItem) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE graceful_exit_transfers SET failed_count = failed_count + 1
            WHERE node_id = ? AND stream_id = ? AND position = ?
            "#,
        )
        .bind(item.node_id.to_vec())
        .bind(item.stream_id.as_bytes().to_vec())
        .bind(item.position as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn progress(&self, node: NodeId) -> Result<TransferProgress> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN completed_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS transferred,
                COALESCE(SUM(CASE WHEN failed_count > 0 AND completed_at IS NULL THEN 1 ELSE 0 END), 0) AS failed
            FROM graceful_exit_transfers WHERE node_id = ?
            "#,
        )
        .bind(node.to_vec())
        .fetch_one(&self.pool)
        .await?;
        let transferred: i64 = row.try_get("transferred")?;
        let failed: i64 = row.try_get("failed")?;
        Ok(TransferProgress {
            pieces_transferred: transferred as u64,
            pieces_failed: failed as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(node: u8, stream: u8, position: u64) -> TransferItem {
        TransferItem {
            node_id: NodeId([node; 32]),
            stream_id: Uuid::from_bytes([stream; 16]),
            position,
            piece_number: 0,
        }
    }

    #[tokio::test]
    async fn test_enqueue_idempotent() {
        let queue = TransferQueue::open_in_memory().await.unwrap();
        let node = NodeId([1u8; 32]);
        let items = vec![item(1, 1, 0), item(1, 2, 0)];

        queue.enqueue(node, &items).await.unwrap();
        queue.enqueue(node, &items).await.unwrap();
        assert_eq!(queue.incomplete_count(node).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transfer_lifecycle() {
        let queue = TransferQueue::open_in_memory().await.unwrap();
        let node = NodeId([1u8; 32]);
        queue
            .enqueue(node, &[item(1, 1, 0), item(1, 2, 0)])
            .await
            .unwrap();

        let pending = queue.incomplete(node, 10).await.unwrap();
        assert_eq!(pending.len(), 2);

        queue.mark_transferred(&pending[0]).await.unwrap();
        queue.mark_failed(&pending[1]).await.unwrap();

        assert_eq!(queue.incomplete_count(node).await.unwrap(), 1);
        let progress = queue.progress(node).await.unwrap();
        assert_eq!(progress.pieces_transferred, 1);
        assert_eq!(progress.pieces_failed, 1);
    }
}
