//! SQLite adapter.
//!
//! Implements the full `Adapter` capability set over a SQLx pool using
//! runtime queries, so building does not depend on a live database. Schema
//! is applied on open with idempotent DDL.
//!
//! Node aliases ride on an AUTOINCREMENT primary key: SQLite guarantees
//! those are never reused, which is exactly the alias invariant. Ensuring an
//! alias is `INSERT OR IGNORE`, so concurrent calls for the same node cannot
//! mint duplicates.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use galaxy_core::{NodeId, PieceId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::adapter::{Adapter, BeginObjectNextVersion};
use crate::error::{Error, Result};
use crate::types::{
    pack_redundancy, unpack_redundancy, AliasPiece, EncryptionParameters, NodeAliasEntry, Object,
    ObjectStatus, ObjectStream, Piece, Segment, SegmentPosition,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    project_id BLOB NOT NULL,
    bucket_name TEXT NOT NULL,
    object_key BLOB NOT NULL,
    version INTEGER NOT NULL,
    stream_id BLOB NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    status INTEGER NOT NULL,
    segment_count INTEGER NOT NULL DEFAULT 0,
    encrypted_metadata_nonce BLOB,
    encrypted_metadata BLOB,
    encrypted_metadata_encrypted_key BLOB,
    total_plain_size INTEGER NOT NULL DEFAULT 0,
    total_encrypted_size INTEGER NOT NULL DEFAULT 0,
    fixed_segment_size INTEGER NOT NULL DEFAULT 0,
    encryption INTEGER NOT NULL DEFAULT 0,
    zombie_deletion_deadline TEXT,
    PRIMARY KEY (project_id, bucket_name, object_key, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS objects_stream_id ON objects (stream_id);

CREATE TABLE IF NOT EXISTS segments (
    stream_id BLOB NOT NULL,
    position INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    repaired_at TEXT,
    expires_at TEXT,
    root_piece_id BLOB NOT NULL,
    encrypted_key_nonce BLOB NOT NULL,
    encrypted_key BLOB NOT NULL,
    encrypted_size INTEGER NOT NULL,
    plain_size INTEGER NOT NULL,
    plain_offset INTEGER NOT NULL,
    encrypted_etag BLOB NOT NULL,
    redundancy INTEGER NOT NULL,
    inline_data BLOB,
    remote_alias_pieces TEXT,
    placement INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (stream_id, position)
);

CREATE TABLE IF NOT EXISTS node_aliases (
    node_alias INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id BLOB NOT NULL UNIQUE
);
"#;

pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
                .map_err(sqlx::Error::from)?
                .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Self::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same memory store.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn apply_schema(pool: &SqlitePool) -> Result<()> {
        for statement in SCHEMA.split(';') {
            if statement.trim().is_empty() {
                continue;
            }
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    fn row_to_object(row: &SqliteRow) -> Result<Object> {
        let stream_id: Vec<u8> = row.try_get("stream_id")?;
        let project_id: Vec<u8> = row.try_get("project_id")?;
        let status: i64 = row.try_get("status")?;
        Ok(Object {
            stream: ObjectStream {
                project_id: Uuid::from_slice(&project_id)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?,
                bucket_name: row.try_get("bucket_name")?,
                object_key: row.try_get("object_key")?,
                version: row.try_get("version")?,
                stream_id: Uuid::from_slice(&stream_id)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?,
            },
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            status: ObjectStatus::from_i64(status)
                .ok_or_else(|| Error::InvalidRequest(format!("bad object status {status}")))?,
            segment_count: row.try_get("segment_count")?,
            encrypted_metadata_nonce: row.try_get("encrypted_metadata_nonce")?,
            encrypted_metadata: row.try_get("encrypted_metadata")?,
            encrypted_metadata_encrypted_key: row.try_get("encrypted_metadata_encrypted_key")?,
            total_plain_size: row.try_get("total_plain_size")?,
            total_encrypted_size: row.try_get("total_encrypted_size")?,
            fixed_segment_size: row.try_get("fixed_segment_size")?,
            encryption: EncryptionParameters::unpack(row.try_get("encryption")?),
            zombie_deletion_deadline: row.try_get("zombie_deletion_deadline")?,
        })
    }

    fn row_to_segment(row: &SqliteRow, aliases: &HashMap<i64, NodeId>) -> Result<Segment> {
        let stream_id: Vec<u8> = row.try_get("stream_id")?;
        let root_piece_id: Vec<u8> = row.try_get("root_piece_id")?;
        let position: i64 = row.try_get("position")?;
        let placement: i64 = row.try_get("placement")?;

        let alias_json: Option<String> = row.try_get("remote_alias_pieces")?;
        let mut pieces = Vec::new();
        if let Some(json) = alias_json {
            let alias_pieces: Vec<AliasPiece> = serde_json::from_str(&json)?;
            for ap in alias_pieces {
                let node = aliases
                    .get(&(ap.alias as i64))
                    .ok_or(Error::NodeIdMissing(ap.alias as i64))?;
                pieces.push(Piece {
                    number: ap.number,
                    storage_node: *node,
                });
            }
        }

        Ok(Segment {
            stream_id: Uuid::from_slice(&stream_id)
                .map_err(|e| Error::InvalidRequest(e.to_string()))?,
            position: SegmentPosition::decode(position as u64),
            created_at: row.try_get("created_at")?,
            repaired_at: row.try_get("repaired_at")?,
            expires_at: row.try_get("expires_at")?,
            root_piece_id: PieceId::from_bytes(&root_piece_id)
                .map_err(|e| Error::InvalidRequest(e.to_string()))?,
            encrypted_key_nonce: row.try_get("encrypted_key_nonce")?,
            encrypted_key: row.try_get("encrypted_key")?,
            encrypted_size: row.try_get("encrypted_size")?,
            plain_size: row.try_get("plain_size")?,
            plain_offset: row.try_get("plain_offset")?,
            encrypted_etag: row.try_get("encrypted_etag")?,
            redundancy: unpack_redundancy(row.try_get("redundancy")?),
            inline_data: row.try_get("inline_data")?,
            pieces,
            placement: galaxy_core::PlacementConstraint::from_u16(placement as u16)
                .ok_or_else(|| Error::InvalidRequest(format!("bad placement {placement}")))?,
        })
    }

    async fn alias_to_node_map(&self) -> Result<HashMap<i64, NodeId>> {
        let rows = sqlx::query("SELECT node_alias, node_id FROM node_aliases")
            .fetch_all(&self.pool)
            .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let alias: i64 = row.try_get("node_alias")?;
            let id: Vec<u8> = row.try_get("node_id")?;
            map.insert(
                alias,
                NodeId::from_bytes(&id).map_err(|e| Error::InvalidRequest(e.to_string()))?,
            );
        }
        Ok(map)
    }

    async fn node_to_alias_map(&self) -> Result<HashMap<NodeId, i64>> {
        Ok(self
            .alias_to_node_map()
            .await?
            .into_iter()
            .map(|(alias, id)| (id, alias))
            .collect())
    }

    fn alias_pieces_json(pieces: &[Piece], aliases: &HashMap<NodeId, i64>) -> Result<String> {
        let mut alias_pieces = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let alias = aliases
                .get(&piece.storage_node)
                .ok_or_else(|| Error::AliasMissing(piece.storage_node.to_string()))?;
            alias_pieces.push(AliasPiece {
                number: piece.number,
                alias: *alias as i32,
            });
        }
        Ok(serde_json::to_string(&alias_pieces)?)
    }

    async fn insert_object_row(&self, object: &Object) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (
                project_id, bucket_name, object_key, version, stream_id,
                created_at, expires_at, status, segment_count,
                encrypted_metadata_nonce, encrypted_metadata, encrypted_metadata_encrypted_key,
                total_plain_size, total_encrypted_size, fixed_segment_size,
                encryption, zombie_deletion_deadline
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(object.stream.project_id.as_bytes().to_vec())
        .bind(&object.stream.bucket_name)
        .bind(&object.stream.object_key)
        .bind(object.stream.version)
        .bind(object.stream.stream_id.as_bytes().to_vec())
        .bind(object.created_at)
        .bind(object.expires_at)
        .bind(object.status as i64)
        .bind(object.segment_count)
        .bind(&object.encrypted_metadata_nonce)
        .bind(&object.encrypted_metadata)
        .bind(&object.encrypted_metadata_encrypted_key)
        .bind(object.total_plain_size)
        .bind(object.total_encrypted_size)
        .bind(object.fixed_segment_size)
        .bind(object.encryption.pack())
        .bind(object.zombie_deletion_deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_segment_row(&self, segment: &Segment) -> Result<()> {
        let alias_json = if segment.pieces.is_empty() {
            None
        } else {
            let aliases = self.node_to_alias_map().await?;
            Some(Self::alias_pieces_json(&segment.pieces, &aliases)?)
        };
        sqlx::query(
            r#"
            INSERT INTO segments (
                stream_id, position, created_at, repaired_at, expires_at,
                root_piece_id, encrypted_key_nonce, encrypted_key,
                encrypted_size, plain_size, plain_offset, encrypted_etag,
                redundancy, inline_data, remote_alias_pieces, placement
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(segment.stream_id.as_bytes().to_vec())
        .bind(segment.position.encode() as i64)
        .bind(segment.created_at)
        .bind(segment.repaired_at)
        .bind(segment.expires_at)
        .bind(segment.root_piece_id.to_vec())
        .bind(&segment.encrypted_key_nonce)
        .bind(&segment.encrypted_key)
        .bind(segment.encrypted_size)
        .bind(segment.plain_size)
        .bind(segment.plain_offset)
        .bind(&segment.encrypted_etag)
        .bind(pack_redundancy(&segment.redundancy))
        .bind(&segment.inline_data)
        .bind(alias_json)
        .bind(segment.placement.as_u16() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    async fn begin_object_next_version(&self, opts: BeginObjectNextVersion) -> Result<Object> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(version), 0) AS max_version
            FROM objects
            WHERE project_id = ? AND bucket_name = ? AND object_key = ?
            "#,
        )
        .bind(opts.project_id.as_bytes().to_vec())
        .bind(&opts.bucket_name)
        .bind(&opts.object_key)
        .fetch_one(&mut *tx)
        .await?;
        let version: i64 = row.try_get("max_version")?;
        let version = version + 1;

        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO objects (
                project_id, bucket_name, object_key, version, stream_id,
                created_at, expires_at, status, encryption, zombie_deletion_deadline
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(opts.project_id.as_bytes().to_vec())
        .bind(&opts.bucket_name)
        .bind(&opts.object_key)
        .bind(version)
        .bind(opts.stream_id.as_bytes().to_vec())
        .bind(created_at)
        .bind(opts.expires_at)
        .bind(ObjectStatus::Pending as i64)
        .bind(opts.encryption.pack())
        .bind(opts.zombie_deletion_deadline)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Object {
            stream: ObjectStream {
                project_id: opts.project_id,
                bucket_name: opts.bucket_name,
                object_key: opts.object_key,
                version,
                stream_id: opts.stream_id,
            },
            created_at,
            expires_at: opts.expires_at,
            status: ObjectStatus::Pending,
            segment_count: 0,
            encrypted_metadata_nonce: None,
            encrypted_metadata: None,
            encrypted_metadata_encrypted_key: None,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: 0,
            encryption: opts.encryption,
            zombie_deletion_deadline: opts.zombie_deletion_deadline,
        })
    }

    async fn testing_begin_object_exact_version(
        &self,
        opts: BeginObjectNextVersion,
        version: i64,
    ) -> Result<Object> {
        let created_at = Utc::now();
        let object = Object {
            stream: ObjectStream {
                project_id: opts.project_id,
                bucket_name: opts.bucket_name.clone(),
                object_key: opts.object_key.clone(),
                version,
                stream_id: opts.stream_id,
            },
            created_at,
            expires_at: opts.expires_at,
            status: ObjectStatus::Pending,
            segment_count: 0,
            encrypted_metadata_nonce: None,
            encrypted_metadata: None,
            encrypted_metadata_encrypted_key: None,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: 0,
            encryption: opts.encryption,
            zombie_deletion_deadline: opts.zombie_deletion_deadline,
        };
        self.insert_object_row(&object).await?;
        Ok(object)
    }

    async fn pending_object_exists(&self, stream_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM objects WHERE stream_id = ? AND status = ?")
            .bind(stream_id.as_bytes().to_vec())
            .bind(ObjectStatus::Pending as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn commit_object(&self, stream: ObjectStream) -> Result<Object> {
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query(
            r#"
            SELECT * FROM objects
            WHERE stream_id = ? AND status = ?
            "#,
        )
        .bind(stream.stream_id.as_bytes().to_vec())
        .bind(ObjectStatus::Pending as i64)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::PendingObjectMissing)?;
        let mut object = Self::row_to_object(&pending)?;

        let stats = sqlx::query(
            r#"
            SELECT COUNT(*) AS segment_count,
                   COALESCE(SUM(plain_size), 0) AS total_plain_size,
                   COALESCE(SUM(encrypted_size), 0) AS total_encrypted_size
            FROM segments WHERE stream_id = ?
            "#,
        )
        .bind(stream.stream_id.as_bytes().to_vec())
        .fetch_one(&mut *tx)
        .await?;
        let segment_count: i64 = stats.try_get("segment_count")?;
        let total_plain_size: i64 = stats.try_get("total_plain_size")?;
        let total_encrypted_size: i64 = stats.try_get("total_encrypted_size")?;

        sqlx::query(
            r#"
            UPDATE objects
            SET status = ?, segment_count = ?, total_plain_size = ?,
                total_encrypted_size = ?, zombie_deletion_deadline = NULL
            WHERE stream_id = ? AND status = ?
            "#,
        )
        .bind(ObjectStatus::Committed as i64)
        .bind(segment_count)
        .bind(total_plain_size)
        .bind(total_encrypted_size)
        .bind(stream.stream_id.as_bytes().to_vec())
        .bind(ObjectStatus::Pending as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        object.status = ObjectStatus::Committed;
        object.segment_count = segment_count as i32;
        object.total_plain_size = total_plain_size;
        object.total_encrypted_size = total_encrypted_size;
        object.zombie_deletion_deadline = None;
        Ok(object)
    }

    async fn get_object_last_committed(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        object_key: &[u8],
    ) -> Result<Object> {
        // a delete marker at a higher version shadows the committed object
        let row = sqlx::query(
            r#"
            SELECT * FROM objects
            WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND status IN (?, ?)
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(project_id.as_bytes().to_vec())
        .bind(bucket_name)
        .bind(object_key)
        .bind(ObjectStatus::Committed as i64)
        .bind(ObjectStatus::DeleteMarker as i64)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::ObjectNotFound)?;
        let object = Self::row_to_object(&row)?;
        if object.status == ObjectStatus::DeleteMarker {
            return Err(Error::ObjectNotFound);
        }
        Ok(object)
    }

    async fn delete_object_last_committed(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        object_key: &[u8],
    ) -> Result<Object> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(version), 0) AS max_version
            FROM objects
            WHERE project_id = ? AND bucket_name = ? AND object_key = ?
            "#,
        )
        .bind(project_id.as_bytes().to_vec())
        .bind(bucket_name)
        .bind(object_key)
        .fetch_one(&mut *tx)
        .await?;
        let max_version: i64 = row.try_get("max_version")?;
        if max_version == 0 {
            return Err(Error::ObjectNotFound);
        }

        let created_at = Utc::now();
        let stream_id = Uuid::new_v4();
        let version = max_version + 1;
        sqlx::query(
            r#"
            INSERT INTO objects (
                project_id, bucket_name, object_key, version, stream_id,
                created_at, status, encryption
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(project_id.as_bytes().to_vec())
        .bind(bucket_name)
        .bind(object_key)
        .bind(version)
        .bind(stream_id.as_bytes().to_vec())
        .bind(created_at)
        .bind(ObjectStatus::DeleteMarker as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Object {
            stream: ObjectStream {
                project_id,
                bucket_name: bucket_name.to_string(),
                object_key: object_key.to_vec(),
                version,
                stream_id,
            },
            created_at,
            expires_at: None,
            status: ObjectStatus::DeleteMarker,
            segment_count: 0,
            encrypted_metadata_nonce: None,
            encrypted_metadata: None,
            encrypted_metadata_encrypted_key: None,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: 0,
            encryption: EncryptionParameters::default(),
            zombie_deletion_deadline: None,
        })
    }

    async fn list_objects(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        cursor_key: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<Object>> {
        let cursor = cursor_key.map(|k| k.to_vec()).unwrap_or_default();
        let rows = sqlx::query(
            r#"
            SELECT o.* FROM objects o
            WHERE o.project_id = ? AND o.bucket_name = ? AND o.object_key > ?
              AND o.status = ?
              AND o.version = (
                SELECT MAX(v.version) FROM objects v
                WHERE v.project_id = o.project_id AND v.bucket_name = o.bucket_name
                  AND v.object_key = o.object_key AND v.status IN (?, ?)
              )
            ORDER BY o.object_key
            LIMIT ?
            "#,
        )
        .bind(project_id.as_bytes().to_vec())
        .bind(bucket_name)
        .bind(cursor)
        .bind(ObjectStatus::Committed as i64)
        .bind(ObjectStatus::Committed as i64)
        .bind(ObjectStatus::DeleteMarker as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_object).collect()
    }

    async fn delete_zombie_objects(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM objects
            WHERE status = ? AND zombie_deletion_deadline IS NOT NULL
              AND zombie_deletion_deadline < ?
            "#,
        )
        .bind(ObjectStatus::Pending as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ensure_node_aliases(&self, nodes: &[NodeId]) -> Result<()> {
        let mut unique: Vec<&NodeId> = Vec::with_capacity(nodes.len());
        let mut seen = std::collections::HashSet::new();
        for node in nodes {
            if node.is_zero() {
                return Err(Error::InvalidRequest(
                    "tried to add alias to zero node".to_string(),
                ));
            }
            if seen.insert(*node) {
                unique.push(node);
            }
        }
        unique.sort();

        let mut tx = self.pool.begin().await?;
        for node in unique {
            sqlx::query("INSERT OR IGNORE INTO node_aliases (node_id) VALUES (?)")
                .bind(node.to_vec())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_node_aliases(&self) -> Result<Vec<NodeAliasEntry>> {
        let rows = sqlx::query("SELECT node_alias, node_id FROM node_aliases ORDER BY node_alias")
            .fetch_all(&self.pool)
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let alias: i64 = row.try_get("node_alias")?;
            let id: Vec<u8> = row.try_get("node_id")?;
            entries.push(NodeAliasEntry {
                id: NodeId::from_bytes(&id).map_err(|e| Error::InvalidRequest(e.to_string()))?,
                alias: alias as i32,
            });
        }
        Ok(entries)
    }

    async fn insert_segment(&self, segment: &Segment) -> Result<()> {
        self.insert_segment_row(segment).await
    }

    async fn batch_insert_segments(&self, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            self.insert_segment_row(segment).await?;
        }
        Ok(())
    }

    async fn batch_insert_objects(&self, objects: &[Object]) -> Result<()> {
        for object in objects {
            self.insert_object_row(object).await?;
        }
        Ok(())
    }

    async fn list_segments(
        &self,
        cursor: Option<(Uuid, u64)>,
        end: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Segment>> {
        let aliases = self.alias_to_node_map().await?;
        let (cursor_stream, cursor_position) = match cursor {
            Some((stream, position)) => (stream.as_bytes().to_vec(), position as i64),
            None => (Vec::new(), -1),
        };
        // an end bound past every uuid keeps the query shape uniform
        let end_stream = end
            .map(|e| e.as_bytes().to_vec())
            .unwrap_or_else(|| vec![0xFF; 17]);
        let rows = sqlx::query(
            r#"
            SELECT * FROM segments
            WHERE (stream_id, position) > (?, ?) AND stream_id < ?
            ORDER BY stream_id, position
            LIMIT ?
            "#,
        )
        .bind(cursor_stream)
        .bind(cursor_position)
        .bind(end_stream)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::row_to_segment(row, &aliases))
            .collect()
    }

    async fn count_segments(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM segments")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn delete_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM objects").execute(&self.pool).await?;
        sqlx::query("DELETE FROM segments").execute(&self.pool).await?;
        sqlx::query("DELETE FROM node_aliases")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
