//! The blob store contract.
//!
//! A blob store maps `(namespace, key)` to a byte stream plus a storage
//! format version. Two implementations exist: the directory-per-namespace
//! `FileStore` in this crate, and the hashstore engine wrapped per satellite
//! by the storage node's piece backend. Writers must be committed or
//! cancelled; a committed blob is readable by subsequent opens, and a
//! cancelled or crashed writer leaves no observable blob.

use std::io::{Read, Seek, Write};
use std::time::SystemTime;

use galaxy_core::NodeId;

use crate::error::Result;

/// Storage format version stored alongside each blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FormatVersion(pub u32);

impl FormatVersion {
    pub const V1: FormatVersion = FormatVersion(1);
}

/// Reference to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub namespace: Vec<u8>,
    pub key: Vec<u8>,
}

impl BlobRef {
    pub fn is_valid(&self) -> bool {
        !self.namespace.is_empty() && !self.key.is_empty()
    }
}

/// Metadata about a stored blob.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub blob_ref: BlobRef,
    pub format_version: FormatVersion,
    pub size: u64,
    pub modified: SystemTime,
}

/// Writer returned by `create`. Either `commit` or `cancel` must be called.
pub trait BlobWriter: Write + Seek + Send {
    fn size(&self) -> u64;
    fn storage_format_version(&self) -> FormatVersion;
    fn commit(self: Box<Self>) -> Result<()>;
    fn cancel(self: Box<Self>) -> Result<()>;
}

/// Reader over a committed blob.
pub trait BlobReader: Read + Seek + Send {
    fn size(&self) -> u64;
    fn storage_format_version(&self) -> FormatVersion;
}

/// A blob storage provider.
pub trait BlobStore: Send + Sync {
    /// Create a new blob. Nothing is observable until the writer commits.
    fn create(&self, blob_ref: &BlobRef) -> Result<Box<dyn BlobWriter>>;

    /// Open a committed blob for reading.
    fn open(&self, blob_ref: &BlobRef) -> Result<Box<dyn BlobReader>>;

    /// Look up metadata without opening the blob.
    fn stat(&self, blob_ref: &BlobRef) -> Result<BlobInfo>;

    /// Delete a blob. Missing blobs are not an error.
    fn delete(&self, blob_ref: &BlobRef) -> Result<()>;

    /// Soft-delete: move a blob to the namespace's trash.
    fn trash(&self, blob_ref: &BlobRef) -> Result<()>;

    /// Restore everything in the namespace's trash, returning restored keys.
    fn restore_trash(&self, namespace: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Remove trash entries older than `before`. Returns bytes and keys
    /// removed.
    fn empty_trash(&self, namespace: &[u8], before: SystemTime) -> Result<(u64, Vec<Vec<u8>>)>;

    /// Visit every blob in the namespace. Stops early on callback error.
    fn walk_namespace(
        &self,
        namespace: &[u8],
        walk: &mut dyn FnMut(BlobInfo) -> Result<()>,
    ) -> Result<()>;

    /// All namespaces in which blobs might be stored.
    fn list_namespaces(&self) -> Result<Vec<Vec<u8>>>;

    /// Total bytes used by blobs in the namespace.
    fn space_used_in_namespace(&self, namespace: &[u8]) -> Result<u64>;

    /// Free bytes on the underlying disk.
    fn free_space(&self) -> Result<u64>;

    /// Delete every blob in the namespace.
    fn delete_namespace(&self, namespace: &[u8]) -> Result<()>;

    /// Delete the namespace's trash folder.
    fn delete_trash_namespace(&self, namespace: &[u8]) -> Result<()>;

    /// Verify the directory is writable by creating and removing a probe.
    fn check_writability(&self) -> Result<()>;

    /// Write the verification file binding this directory to a node id.
    fn create_verification_file(&self, id: &NodeId) -> Result<()>;

    /// Check the verification file matches the expected node id.
    fn verify_storage_dir(&self, id: &NodeId) -> Result<()>;
}
