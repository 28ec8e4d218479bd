//! Object and Segment Catalog for the Galaxy Satellite
//!
//! The metabase is the authoritative record of what exists in the network:
//! objects addressed by `(project, bucket, key, version)`, their segment
//! streams, and the piece placement of every remote segment.
//!
//! ## Shape
//!
//! - **types**: plain record structs plus the packed on-disk encodings
//! - **adapter**: the backend seam; all SQL hides behind it
//! - **sqlite**: the relational adapter (sqlx, runtime queries)
//! - **alias**: the node-alias compaction layer mapping 32-byte node ids to
//!   local 32-bit aliases inside segment piece lists
//! - **metabase**: the service tying it together with validation
//!
//! ## Versioning
//!
//! Object versions only move forward: `begin_object_next_version` reads the
//! key's max version and inserts at `max + 1` inside one transaction, and
//! commits flip exactly one pending record. There is at most one committed
//! object per `(project, bucket, key, version)`.

pub mod adapter;
pub mod alias;
pub mod error;
pub mod metabase;
pub mod sqlite;
pub mod types;

pub use adapter::{Adapter, BeginObjectNextVersion};
pub use alias::NodeAliasMap;
pub use error::{Error, Result};
pub use metabase::Metabase;
pub use sqlite::SqliteAdapter;
pub use types::{
    AliasPiece, EncryptionParameters, NodeAlias, NodeAliasEntry, Object, ObjectStatus,
    ObjectStream, Piece, Segment, SegmentPosition,
};
