//! Piece Storage Engines for Galaxy Storage Nodes
//!
//! Two ways to persist pieces on local disk behind one contract:
//!
//! - **FileStore**: one file per blob under a namespace directory tree, with
//!   a sidecar trash tree. Simple, debuggable, and the fallback engine.
//! - **Hashstore**: append-only log files plus an on-disk hash table of
//!   fixed 64-byte records. Built for piece workloads: writes are pure
//!   appends, lookups are a page read or two, and deletion is deferred to
//!   compaction.
//!
//! See `db` for the hashstore's directory layout and crash model, and
//! `blobstore` for the shared contract.

pub mod blobstore;
pub mod db;
pub mod error;
pub mod filestore;
pub mod hashtbl;
pub mod logfile;
pub mod record;
pub mod writer;

pub use blobstore::{BlobInfo, BlobReader, BlobRef, BlobStore, BlobWriter, FormatVersion};
pub use db::{Db, TRASH_TTL_DAYS};
pub use error::{Error, Result};
pub use filestore::FileStore;
pub use logfile::{LogReader, FOOTER_SIZE};
pub use record::{Expiration, Key, Record};
pub use writer::Writer;
