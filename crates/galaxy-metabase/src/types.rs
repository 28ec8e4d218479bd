//! Catalog record types.
//!
//! An object is addressed by `(project, bucket, key, version)` and points at
//! a stream of segments. Segments store their piece placement as compact
//! node aliases rather than full 32-byte node ids; the alias table is the
//! bijection between the two.

use chrono::{DateTime, Utc};
use galaxy_core::{NodeId, PieceId, PlacementConstraint, RedundancyScheme};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one object version and its underlying stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectStream {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: Vec<u8>,
    pub version: i64,
    pub stream_id: Uuid,
}

/// Lifecycle status of an object record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ObjectStatus {
    Pending = 1,
    Committed = 3,
    DeleteMarker = 5,
}

impl ObjectStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            3 => Some(Self::Committed),
            5 => Some(Self::DeleteMarker),
            _ => None,
        }
    }
}

/// Encryption parameters recorded per object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncryptionParameters {
    pub cipher_suite: i32,
    pub block_size: i32,
}

impl EncryptionParameters {
    pub fn pack(&self) -> i64 {
        ((self.cipher_suite as i64) << 32) | (self.block_size as u32 as i64)
    }

    pub fn unpack(value: i64) -> Self {
        Self {
            cipher_suite: (value >> 32) as i32,
            block_size: value as i32,
        }
    }
}

/// Full object record.
#[derive(Debug, Clone)]
pub struct Object {
    pub stream: ObjectStream,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ObjectStatus,
    pub segment_count: i32,
    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    pub fixed_segment_size: i32,
    pub encryption: EncryptionParameters,
    /// Pending uploads are reaped once this deadline passes.
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

/// Position of a segment within its stream: a part for multipart uploads
/// and an index within the part, packed into a u64 on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    pub fn encode(&self) -> u64 {
        ((self.part as u64) << 32) | self.index as u64
    }

    pub fn decode(value: u64) -> Self {
        Self {
            part: (value >> 32) as u32,
            index: value as u32,
        }
    }
}

/// Compact 32-bit node reference local to one metabase.
pub type NodeAlias = i32;

/// Mapping entry between a node id and its alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAliasEntry {
    pub id: NodeId,
    pub alias: NodeAlias,
}

/// One remote piece by full node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub number: u16,
    pub storage_node: NodeId,
}

/// One remote piece by alias, the on-disk representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasPiece {
    pub number: u16,
    pub alias: NodeAlias,
}

/// Full segment record.
#[derive(Debug, Clone)]
pub struct Segment {
    pub stream_id: Uuid,
    pub position: SegmentPosition,
    pub created_at: DateTime<Utc>,
    pub repaired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    /// Size of the whole encrypted segment, not one piece.
    pub encrypted_size: i32,
    pub plain_size: i32,
    pub plain_offset: i64,
    pub encrypted_etag: Vec<u8>,
    pub redundancy: RedundancyScheme,
    pub inline_data: Option<Vec<u8>>,
    pub pieces: Vec<Piece>,
    pub placement: PlacementConstraint,
}

impl Segment {
    pub fn is_inline(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| now > t).unwrap_or(false)
    }
}

/// Pack a redundancy scheme into one i64 column.
pub fn pack_redundancy(rs: &RedundancyScheme) -> i64 {
    ((rs.required as i64) << 48)
        | ((rs.repair as i64) << 32)
        | ((rs.optimal as i64) << 16)
        | rs.total as i64
}

pub fn unpack_redundancy(value: i64) -> RedundancyScheme {
    RedundancyScheme {
        required: (value >> 48) as u16,
        repair: (value >> 32) as u16,
        optimal: (value >> 16) as u16,
        total: value as u16,
    }
}
