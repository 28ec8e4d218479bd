//! Segment sources for the ranged loop.

use std::sync::Arc;

use async_trait::async_trait;
use galaxy_metabase::{Metabase, Segment};
use uuid::Uuid;

use super::UuidRange;
use crate::error::Result;

/// Yields batches of segments for one range of the stream id space.
#[async_trait]
pub trait SegmentProvider: Send + Sync {
    async fn next_batch(
        &self,
        range: &UuidRange,
        cursor: Option<(Uuid, u64)>,
        batch_size: i64,
    ) -> Result<Vec<Segment>>;
}

/// Production provider paging out of the metabase.
pub struct MetabaseSegmentProvider {
    metabase: Arc<Metabase>,
}

impl MetabaseSegmentProvider {
    pub fn new(metabase: Arc<Metabase>) -> Self {
        Self { metabase }
    }
}

#[async_trait]
impl SegmentProvider for MetabaseSegmentProvider {
    async fn next_batch(
        &self,
        range: &UuidRange,
        cursor: Option<(Uuid, u64)>,
        batch_size: i64,
    ) -> Result<Vec<Segment>> {
        // the adapter cursor is exclusive, so entering a range means
        // starting past the last position of the stream just below its
        // inclusive start; positions are stored as non-negative i64
        let cursor = cursor.or_else(|| {
            range.start.map(|start| {
                (
                    Uuid::from_u128(start.as_u128().saturating_sub(1)),
                    i64::MAX as u64,
                )
            })
        });
        Ok(self
            .metabase
            .list_segments(cursor, range.end, batch_size)
            .await?)
    }
}

/// In-memory provider for observer tests.
pub struct StaticSegmentProvider {
    segments: Vec<Segment>,
}

impl StaticSegmentProvider {
    pub fn new(mut segments: Vec<Segment>) -> Self {
        segments.sort_by_key(|s| (s.stream_id, s.position.encode()));
        Self { segments }
    }
}

#[async_trait]
impl SegmentProvider for StaticSegmentProvider {
    async fn next_batch(
        &self,
        range: &UuidRange,
        cursor: Option<(Uuid, u64)>,
        batch_size: i64,
    ) -> Result<Vec<Segment>> {
        let in_range = |s: &Segment| {
            if let Some(start) = range.start {
                if s.stream_id < start {
                    return false;
                }
            }
            if let Some(end) = range.end {
                if s.stream_id >= end {
                    return false;
                }
            }
            if let Some((stream, position)) = cursor {
                if (s.stream_id, s.position.encode()) <= (stream, position) {
                    return false;
                }
            }
            true
        };
        Ok(self
            .segments
            .iter()
            .filter(|s| in_range(s))
            .take(batch_size as usize)
            .cloned()
            .collect())
    }
}
