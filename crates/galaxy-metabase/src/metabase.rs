//! The metabase service.
//!
//! Front door for the object and segment catalog. Validation and alias
//! translation happen here; all SQL lives behind the adapter seam. The
//! metabase holds an ordered list of adapters and routes every operation to
//! the first one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use galaxy_core::NodeId;
use tracing::info;
use uuid::Uuid;

use crate::adapter::{Adapter, BeginObjectNextVersion};
use crate::alias::{AliasCache, NodeAliasMap};
use crate::error::{Error, Result};
use crate::types::{NodeAliasEntry, Object, ObjectStream, Segment};

pub struct Metabase {
    adapters: Vec<Arc<dyn Adapter>>,
    alias_cache: AliasCache,
}

impl Metabase {
    /// Build a metabase over one or more conforming adapters.
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        assert!(!adapters.is_empty(), "metabase needs at least one adapter");
        Self {
            adapters,
            alias_cache: AliasCache::default(),
        }
    }

    fn choose_adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapters[0]
    }

    /// Start a new pending object at the next version of its key.
    pub async fn begin_object_next_version(
        &self,
        opts: BeginObjectNextVersion,
    ) -> Result<Object> {
        if opts.bucket_name.is_empty() {
            return Err(Error::InvalidRequest("bucket name missing".to_string()));
        }
        if opts.object_key.is_empty() {
            return Err(Error::InvalidRequest("object key missing".to_string()));
        }
        self.choose_adapter().begin_object_next_version(opts).await
    }

    /// Testing only: pin the version explicitly.
    pub async fn testing_begin_object_exact_version(
        &self,
        opts: BeginObjectNextVersion,
        version: i64,
    ) -> Result<Object> {
        self.choose_adapter()
            .testing_begin_object_exact_version(opts, version)
            .await
    }

    /// Commit a pending object, aggregating its segment statistics.
    pub async fn commit_object(&self, stream: ObjectStream) -> Result<Object> {
        let object = self.choose_adapter().commit_object(stream).await?;
        info!(
            stream_id = %object.stream.stream_id,
            version = object.stream.version,
            segments = object.segment_count,
            "object committed"
        );
        Ok(object)
    }

    pub async fn get_object_last_committed(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        object_key: &[u8],
    ) -> Result<Object> {
        self.choose_adapter()
            .get_object_last_committed(project_id, bucket_name, object_key)
            .await
    }

    /// Delete an object by writing a delete marker at the next version.
    /// The underlying versions stay in place for versioned reads.
    pub async fn delete_object_last_committed(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        object_key: &[u8],
    ) -> Result<Object> {
        let marker = self
            .choose_adapter()
            .delete_object_last_committed(project_id, bucket_name, object_key)
            .await?;
        info!(
            version = marker.stream.version,
            "delete marker written"
        );
        Ok(marker)
    }

    /// Latest committed object per key in a bucket, ordered by key. Keys
    /// whose latest version is a delete marker are hidden.
    pub async fn list_objects(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        cursor_key: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<Object>> {
        self.choose_adapter()
            .list_objects(project_id, bucket_name, cursor_key, limit)
            .await
    }

    /// Reap pending uploads whose zombie deadline has passed.
    pub async fn delete_zombie_objects(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = self.choose_adapter().delete_zombie_objects(now).await?;
        if deleted > 0 {
            info!(deleted, "zombie pending objects reaped");
        }
        Ok(deleted)
    }

    /// Start a segment upload: verifies the stream still has a pending
    /// object, so a reaped or already-committed upload fails early instead
    /// of writing orphaned segments.
    pub async fn begin_segment(&self, stream_id: Uuid) -> Result<()> {
        if !self.choose_adapter().pending_object_exists(stream_id).await? {
            return Err(Error::PendingObjectMissing);
        }
        Ok(())
    }

    /// Record a segment. Inline data and remote pieces are mutually
    /// exclusive; remote segments must carry at least `required` pieces with
    /// unique piece numbers, and every referenced node gets an alias first.
    pub async fn commit_segment(&self, segment: Segment) -> Result<()> {
        match (&segment.inline_data, segment.pieces.is_empty()) {
            (Some(data), true) if !data.is_empty() => {}
            (None, false) => {
                if segment.pieces.len() < segment.redundancy.required as usize {
                    return Err(Error::InvalidRequest(format!(
                        "segment has {} pieces, fewer than required {}",
                        segment.pieces.len(),
                        segment.redundancy.required
                    )));
                }
                let mut numbers: Vec<u16> = segment.pieces.iter().map(|p| p.number).collect();
                numbers.sort_unstable();
                numbers.dedup();
                if numbers.len() != segment.pieces.len() {
                    return Err(Error::InvalidRequest(
                        "duplicate piece numbers in segment".to_string(),
                    ));
                }
            }
            _ => {
                return Err(Error::InvalidRequest(
                    "segment must be either inline or remote".to_string(),
                ));
            }
        }

        if !segment.pieces.is_empty() {
            let nodes: Vec<NodeId> = segment.pieces.iter().map(|p| p.storage_node).collect();
            self.ensure_node_aliases(&nodes).await?;
        }

        self.choose_adapter().insert_segment(&segment).await
    }

    /// Idempotently assign aliases to node ids.
    pub async fn ensure_node_aliases(&self, nodes: &[NodeId]) -> Result<()> {
        self.choose_adapter().ensure_node_aliases(nodes).await?;
        self.alias_cache.reset();
        Ok(())
    }

    pub async fn list_node_aliases(&self) -> Result<Vec<NodeAliasEntry>> {
        self.choose_adapter().list_node_aliases().await
    }

    /// Latest alias snapshot, cached until the table grows.
    pub async fn latest_nodes_alias_map(&self) -> Result<NodeAliasMap> {
        if let Some(map) = self.alias_cache.get() {
            return Ok(map);
        }
        let entries = self.list_node_aliases().await?;
        let map = NodeAliasMap::new(&entries);
        self.alias_cache.set(map.clone());
        Ok(map)
    }

    /// Page through segments in `(stream_id, position)` order, optionally
    /// bounded from above by an exclusive stream id.
    pub async fn list_segments(
        &self,
        cursor: Option<(Uuid, u64)>,
        end: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Segment>> {
        self.choose_adapter().list_segments(cursor, end, limit).await
    }

    pub async fn count_segments(&self) -> Result<i64> {
        self.choose_adapter().count_segments().await
    }

    /// Testing surface: bulk-load raw objects.
    pub async fn testing_batch_insert_objects(&self, objects: &[Object]) -> Result<()> {
        self.choose_adapter().batch_insert_objects(objects).await
    }

    /// Testing surface: bulk-load raw segments.
    pub async fn testing_batch_insert_segments(&self, segments: &[Segment]) -> Result<()> {
        self.choose_adapter().batch_insert_segments(segments).await
    }

    /// Testing surface: wipe the catalog.
    pub async fn testing_delete_all(&self) -> Result<()> {
        self.alias_cache.reset();
        self.choose_adapter().delete_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteAdapter;
    use crate::types::{
        EncryptionParameters, ObjectStatus, Piece, Segment, SegmentPosition,
    };
    use galaxy_core::{PieceId, PlacementConstraint, RedundancyScheme};

    async fn metabase() -> Metabase {
        let adapter = SqliteAdapter::open_in_memory().await.unwrap();
        Metabase::new(vec![Arc::new(adapter)])
    }

    fn begin_opts(stream_id: Uuid) -> BeginObjectNextVersion {
        BeginObjectNextVersion {
            project_id: Uuid::new_v4(),
            bucket_name: "bucket".to_string(),
            object_key: b"path/to/object".to_vec(),
            stream_id,
            expires_at: None,
            encryption: EncryptionParameters {
                cipher_suite: 1,
                block_size: 7424,
            },
            zombie_deletion_deadline: Some(Utc::now() + chrono::Duration::hours(24)),
        }
    }

    fn remote_segment(stream_id: Uuid, nodes: &[NodeId]) -> Segment {
        Segment {
            stream_id,
            position: SegmentPosition { part: 0, index: 0 },
            created_at: Utc::now(),
            repaired_at: None,
            expires_at: None,
            root_piece_id: PieceId([1u8; 32]),
            encrypted_key_nonce: vec![1; 24],
            encrypted_key: vec![2; 32],
            encrypted_size: 4096,
            plain_size: 4000,
            plain_offset: 0,
            encrypted_etag: vec![],
            redundancy: RedundancyScheme::new(2, 3, 4, 6),
            inline_data: None,
            pieces: nodes
                .iter()
                .enumerate()
                .map(|(i, n)| Piece {
                    number: i as u16,
                    storage_node: *n,
                })
                .collect(),
            placement: PlacementConstraint::EveryCountry,
        }
    }

    #[tokio::test]
    async fn test_begin_object_next_version_increments() {
        let mb = metabase().await;
        let project = Uuid::new_v4();

        let mut opts = begin_opts(Uuid::new_v4());
        opts.project_id = project;
        let first = mb.begin_object_next_version(opts.clone()).await.unwrap();
        assert_eq!(first.stream.version, 1);
        assert_eq!(first.status, ObjectStatus::Pending);

        opts.stream_id = Uuid::new_v4();
        let second = mb.begin_object_next_version(opts).await.unwrap();
        assert_eq!(second.stream.version, 2);
    }

    #[tokio::test]
    async fn test_begin_object_validates_input() {
        let mb = metabase().await;
        let mut opts = begin_opts(Uuid::new_v4());
        opts.bucket_name = String::new();
        assert!(mb.begin_object_next_version(opts).await.is_err());

        let mut opts = begin_opts(Uuid::new_v4());
        opts.object_key = Vec::new();
        assert!(mb.begin_object_next_version(opts).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_object_aggregates_segments() {
        let mb = metabase().await;
        let opts = begin_opts(Uuid::new_v4());
        let object = mb.begin_object_next_version(opts).await.unwrap();

        let nodes: Vec<NodeId> = (1..=3u8).map(|i| NodeId([i; 32])).collect();
        let mut segment = remote_segment(object.stream.stream_id, &nodes);
        segment.redundancy = RedundancyScheme::new(2, 3, 4, 6);
        mb.commit_segment(segment.clone()).await.unwrap();
        segment.position = SegmentPosition { part: 0, index: 1 };
        mb.commit_segment(segment).await.unwrap();

        let committed = mb.commit_object(object.stream.clone()).await.unwrap();
        assert_eq!(committed.status, ObjectStatus::Committed);
        assert_eq!(committed.segment_count, 2);
        assert_eq!(committed.total_plain_size, 8000);
        assert_eq!(committed.total_encrypted_size, 8192);
        assert!(committed.zombie_deletion_deadline.is_none());

        // committing twice fails: the pending object is gone
        assert!(matches!(
            mb.commit_object(committed.stream.clone()).await,
            Err(Error::PendingObjectMissing)
        ));
    }

    #[tokio::test]
    async fn test_at_most_one_committed_per_version() {
        let mb = metabase().await;
        let project = Uuid::new_v4();

        // two pending objects for the same key get distinct versions, so
        // committing both leaves one committed object per version
        let mut opts = begin_opts(Uuid::new_v4());
        opts.project_id = project;
        let a = mb.begin_object_next_version(opts.clone()).await.unwrap();
        opts.stream_id = Uuid::new_v4();
        let b = mb.begin_object_next_version(opts.clone()).await.unwrap();
        assert_ne!(a.stream.version, b.stream.version);

        mb.commit_object(a.stream.clone()).await.unwrap();
        mb.commit_object(b.stream.clone()).await.unwrap();

        let last = mb
            .get_object_last_committed(project, "bucket", b"path/to/object")
            .await
            .unwrap();
        assert_eq!(last.stream.version, b.stream.version);
    }

    #[tokio::test]
    async fn test_get_object_last_committed_ignores_pending() {
        let mb = metabase().await;
        let project = Uuid::new_v4();

        let mut opts = begin_opts(Uuid::new_v4());
        opts.project_id = project;
        let a = mb.begin_object_next_version(opts.clone()).await.unwrap();
        mb.commit_object(a.stream.clone()).await.unwrap();

        // later pending version does not shadow the committed one
        opts.stream_id = Uuid::new_v4();
        mb.begin_object_next_version(opts).await.unwrap();

        let last = mb
            .get_object_last_committed(project, "bucket", b"path/to/object")
            .await
            .unwrap();
        assert_eq!(last.stream.version, a.stream.version);
    }

    #[tokio::test]
    async fn test_commit_segment_validations() {
        let mb = metabase().await;
        let stream_id = Uuid::new_v4();
        let nodes: Vec<NodeId> = (1..=3u8).map(|i| NodeId([i; 32])).collect();

        // neither inline nor remote
        let mut segment = remote_segment(stream_id, &nodes);
        segment.pieces.clear();
        assert!(mb.commit_segment(segment).await.is_err());

        // both inline and remote
        let mut segment = remote_segment(stream_id, &nodes);
        segment.inline_data = Some(vec![1, 2, 3]);
        assert!(mb.commit_segment(segment).await.is_err());

        // fewer pieces than required
        let mut segment = remote_segment(stream_id, &nodes[..1].to_vec());
        segment.redundancy = RedundancyScheme::new(2, 3, 4, 6);
        assert!(mb.commit_segment(segment).await.is_err());

        // duplicate piece numbers
        let mut segment = remote_segment(stream_id, &nodes);
        segment.pieces[1].number = segment.pieces[0].number;
        assert!(mb.commit_segment(segment).await.is_err());
    }

    #[tokio::test]
    async fn test_segment_roundtrip_through_aliases() {
        let mb = metabase().await;
        let stream_id = Uuid::new_v4();
        let nodes: Vec<NodeId> = (1..=4u8).map(|i| NodeId([i; 32])).collect();

        let segment = remote_segment(stream_id, &nodes);
        mb.commit_segment(segment.clone()).await.unwrap();

        let listed = mb.list_segments(None, None, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pieces, segment.pieces);
        assert_eq!(listed[0].redundancy, segment.redundancy);
        assert_eq!(listed[0].position, segment.position);
    }

    #[tokio::test]
    async fn test_ensure_node_aliases_idempotent() {
        let mb = metabase().await;
        let nodes: Vec<NodeId> = (1..=3u8).map(|i| NodeId([i; 32])).collect();

        mb.ensure_node_aliases(&nodes).await.unwrap();
        let first = mb.list_node_aliases().await.unwrap();
        assert_eq!(first.len(), 3);

        // second call changes nothing, aliases are stable
        mb.ensure_node_aliases(&nodes).await.unwrap();
        let second = mb.list_node_aliases().await.unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.alias, b.alias);
        }

        let map = mb.latest_nodes_alias_map().await.unwrap();
        for node in &nodes {
            assert!(map.contains(node));
        }
    }

    #[tokio::test]
    async fn test_ensure_node_aliases_rejects_zero_node() {
        let mb = metabase().await;
        assert!(mb
            .ensure_node_aliases(&[NodeId::default()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_zombie_deletion() {
        let mb = metabase().await;
        let mut opts = begin_opts(Uuid::new_v4());
        opts.zombie_deletion_deadline = Some(Utc::now() - chrono::Duration::hours(1));
        mb.begin_object_next_version(opts).await.unwrap();

        let deleted = mb.delete_zombie_objects(Utc::now()).await.unwrap();
        assert_eq!(deleted, 1);

        // committed objects are never reaped
        let opts = begin_opts(Uuid::new_v4());
        let object = mb.begin_object_next_version(opts).await.unwrap();
        mb.commit_object(object.stream).await.unwrap();
        let deleted = mb
            .delete_zombie_objects(Utc::now() + chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn test_begin_segment_requires_pending_object() {
        let mb = metabase().await;

        // unknown stream
        assert!(matches!(
            mb.begin_segment(Uuid::new_v4()).await,
            Err(Error::PendingObjectMissing)
        ));

        // pending stream is fine
        let object = mb
            .begin_object_next_version(begin_opts(Uuid::new_v4()))
            .await
            .unwrap();
        mb.begin_segment(object.stream.stream_id).await.unwrap();

        // once committed, no further segments may begin
        mb.commit_object(object.stream.clone()).await.unwrap();
        assert!(matches!(
            mb.begin_segment(object.stream.stream_id).await,
            Err(Error::PendingObjectMissing)
        ));
    }

    #[tokio::test]
    async fn test_delete_marker_shadows_committed_object() {
        let mb = metabase().await;
        let project = Uuid::new_v4();

        let mut opts = begin_opts(Uuid::new_v4());
        opts.project_id = project;
        let object = mb.begin_object_next_version(opts).await.unwrap();
        mb.commit_object(object.stream.clone()).await.unwrap();

        let marker = mb
            .delete_object_last_committed(project, "bucket", b"path/to/object")
            .await
            .unwrap();
        assert_eq!(marker.status, ObjectStatus::DeleteMarker);
        assert_eq!(marker.stream.version, object.stream.version + 1);

        assert!(matches!(
            mb.get_object_last_committed(project, "bucket", b"path/to/object")
                .await,
            Err(Error::ObjectNotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_object_fails() {
        let mb = metabase().await;
        assert!(matches!(
            mb.delete_object_last_committed(Uuid::new_v4(), "bucket", b"missing")
                .await,
            Err(Error::ObjectNotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_objects_latest_versions_only() {
        let mb = metabase().await;
        let project = Uuid::new_v4();

        for key in [b"a".as_slice(), b"b", b"c"] {
            let mut opts = begin_opts(Uuid::new_v4());
            opts.project_id = project;
            opts.object_key = key.to_vec();
            let object = mb.begin_object_next_version(opts).await.unwrap();
            mb.commit_object(object.stream).await.unwrap();
        }

        // overwrite "b" so its key has two committed versions
        let mut opts = begin_opts(Uuid::new_v4());
        opts.project_id = project;
        opts.object_key = b"b".to_vec();
        let object = mb.begin_object_next_version(opts).await.unwrap();
        mb.commit_object(object.stream).await.unwrap();

        // delete "c": hidden from listing
        mb.delete_object_last_committed(project, "bucket", b"c")
            .await
            .unwrap();

        let listed = mb.list_objects(project, "bucket", None, 10).await.unwrap();
        let keys: Vec<&[u8]> = listed.iter().map(|o| o.stream.object_key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b"]);
        let b = listed.iter().find(|o| o.stream.object_key == b"b").unwrap();
        assert_eq!(b.stream.version, 2);

        // cursor pagination starts after the given key
        let listed = mb
            .list_objects(project, "bucket", Some(b"a"), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stream.object_key, b"b");
    }

    #[tokio::test]
    async fn test_list_segments_pagination() {
        let mb = metabase().await;
        let stream_id = Uuid::new_v4();
        let nodes: Vec<NodeId> = (1..=3u8).map(|i| NodeId([i; 32])).collect();

        for i in 0..5u32 {
            let mut segment = remote_segment(stream_id, &nodes);
            segment.position = SegmentPosition { part: 0, index: i };
            mb.commit_segment(segment).await.unwrap();
        }
        assert_eq!(mb.count_segments().await.unwrap(), 5);

        let first = mb.list_segments(None, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let cursor = Some((first[1].stream_id, first[1].position.encode()));
        let rest = mb.list_segments(cursor, None, 10).await.unwrap();
        assert_eq!(rest.len(), 3);
    }
}
