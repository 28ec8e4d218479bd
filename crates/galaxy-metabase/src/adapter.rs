//! The backend adapter seam.
//!
//! Every piece of backend-specific SQL lives behind this trait. A metabase
//! holds an ordered list of adapters and routes each operation to the first
//! one; any adapter registered here must implement the full capability set.
//! Partial adapters do not get registered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use galaxy_core::NodeId;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{NodeAliasEntry, Object, ObjectStream, Segment};

/// Arguments for starting a new object at the next version of its key.
#[derive(Debug, Clone)]
pub struct BeginObjectNextVersion {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: Vec<u8>,
    pub stream_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
    pub encryption: crate::types::EncryptionParameters,
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Insert a new pending object at `max(version) + 1` for its key, in a
    /// single transaction. Returns the full object with its version filled.
    async fn begin_object_next_version(&self, opts: BeginObjectNextVersion) -> Result<Object>;

    /// Insert a new pending object at exactly the given version. Testing
    /// only: production paths always take the next version.
    async fn testing_begin_object_exact_version(
        &self,
        opts: BeginObjectNextVersion,
        version: i64,
    ) -> Result<Object>;

    /// Whether a pending object exists for the stream.
    async fn pending_object_exists(&self, stream_id: Uuid) -> Result<bool>;

    /// Flip a pending object to committed, aggregating its segment stats.
    async fn commit_object(&self, stream: ObjectStream) -> Result<Object>;

    /// Latest committed object for the key.
    async fn get_object_last_committed(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        object_key: &[u8],
    ) -> Result<Object>;

    /// Remove pending objects whose zombie deadline passed. Returns how many
    /// objects were reaped.
    async fn delete_zombie_objects(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Insert a delete marker at the next version of the key. The marker
    /// shadows the previous committed version for reads.
    async fn delete_object_last_committed(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        object_key: &[u8],
    ) -> Result<Object>;

    /// Enumerate the latest committed object per key within a bucket,
    /// ordered by key, starting after `cursor_key` (exclusive). Keys whose
    /// latest version is a delete marker are skipped.
    async fn list_objects(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        cursor_key: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<Object>>;

    /// Idempotently assign aliases to the given node ids. Concurrent calls
    /// for the same node must not produce duplicate aliases.
    async fn ensure_node_aliases(&self, nodes: &[NodeId]) -> Result<()>;

    /// All alias mappings.
    async fn list_node_aliases(&self) -> Result<Vec<NodeAliasEntry>>;

    /// Insert one segment.
    async fn insert_segment(&self, segment: &Segment) -> Result<()>;

    /// Batch-insert segments. Testing and migration surface.
    async fn batch_insert_segments(&self, segments: &[Segment]) -> Result<()>;

    /// Batch-insert objects. Testing and migration surface.
    async fn batch_insert_objects(&self, objects: &[Object]) -> Result<()>;

    /// Stream segments in `(stream_id, position)` order in batches. The
    /// cursor is exclusive; `end` bounds the stream id space from above
    /// (exclusive) so parallel scans can split it into disjoint ranges.
    async fn list_segments(
        &self,
        cursor: Option<(Uuid, u64)>,
        end: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Segment>>;

    /// Count of all segments.
    async fn count_segments(&self) -> Result<i64>;

    /// Remove everything. Testing only.
    async fn delete_all(&self) -> Result<()>;
}
