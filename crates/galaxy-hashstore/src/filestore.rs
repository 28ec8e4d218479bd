//! Directory-backed blob store.
//!
//! Blobs live at `{base}/blobs/{namespace-hex}/{kk}/{key-hex}.v1` where `kk`
//! is the first byte of the key, keeping directories small. Trash mirrors
//! the same shape under `{base}/trash`. Writers stage into `{base}/tmp` and
//! publish with an atomic rename on commit, so a crashed writer leaves only
//! an orphaned temp file.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use galaxy_core::NodeId;
use tracing::debug;

use crate::blobstore::{BlobInfo, BlobReader, BlobRef, BlobStore, BlobWriter, FormatVersion};
use crate::error::{Error, Result};

const VERIFICATION_FILE: &str = "storage-dir-verification";

pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    pub fn open(base: impl Into<PathBuf>) -> Result<FileStore> {
        let base = base.into();
        fs::create_dir_all(base.join("blobs"))?;
        fs::create_dir_all(base.join("trash"))?;
        fs::create_dir_all(base.join("tmp"))?;
        Ok(FileStore { base })
    }

    fn blob_path(&self, area: &str, blob_ref: &BlobRef) -> Result<PathBuf> {
        if !blob_ref.is_valid() {
            return Err(Error::InvalidBlobRef(
                "empty namespace or key".to_string(),
            ));
        }
        let ns = hex::encode(&blob_ref.namespace);
        let key = hex::encode(&blob_ref.key);
        Ok(self
            .base
            .join(area)
            .join(ns)
            .join(&key[..2.min(key.len())])
            .join(format!("{key}.v1")))
    }

    fn parse_key(path: &Path) -> Option<Vec<u8>> {
        let name = path.file_name()?.to_str()?;
        let key_hex = name.strip_suffix(".v1")?;
        hex::decode(key_hex).ok()
    }

    fn walk_area(
        &self,
        area: &str,
        namespace: &[u8],
        walk: &mut dyn FnMut(BlobInfo) -> Result<()>,
    ) -> Result<()> {
        let ns_dir = self.base.join(area).join(hex::encode(namespace));
        if !ns_dir.exists() {
            return Ok(());
        }
        for bucket in fs::read_dir(&ns_dir)? {
            let bucket = bucket?;
            if !bucket.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(bucket.path())? {
                let entry = entry?;
                let Some(key) = Self::parse_key(&entry.path()) else {
                    continue;
                };
                let meta = entry.metadata()?;
                walk(BlobInfo {
                    blob_ref: BlobRef {
                        namespace: namespace.to_vec(),
                        key,
                    },
                    format_version: FormatVersion::V1,
                    size: meta.len(),
                    modified: meta.modified()?,
                })?;
            }
        }
        Ok(())
    }
}

struct FileBlobWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
    written: u64,
}

impl Write for FileBlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileBlobWriter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl BlobWriter for FileBlobWriter {
    fn size(&self) -> u64 {
        self.written
    }

    fn storage_format_version(&self) -> FormatVersion {
        FormatVersion::V1
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.file.sync_all()?;
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(())
    }

    fn cancel(self: Box<Self>) -> Result<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.tmp_path);
        Ok(())
    }
}

struct FileBlobReader {
    file: File,
    size: u64,
}

impl Read for FileBlobReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileBlobReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl BlobReader for FileBlobReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn storage_format_version(&self) -> FormatVersion {
        FormatVersion::V1
    }
}

impl BlobStore for FileStore {
    fn create(&self, blob_ref: &BlobRef) -> Result<Box<dyn BlobWriter>> {
        static TMP_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let final_path = self.blob_path("blobs", blob_ref)?;
        let tmp_path = self.base.join("tmp").join(format!(
            "{}-{}",
            hex::encode(&blob_ref.key),
            TMP_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        let file = File::create(&tmp_path)?;
        Ok(Box::new(FileBlobWriter {
            tmp_path,
            final_path,
            file,
            written: 0,
        }))
    }

    fn open(&self, blob_ref: &BlobRef) -> Result<Box<dyn BlobReader>> {
        let path = self.blob_path("blobs", blob_ref)?;
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::Io(e)
            }
        })?;
        let size = file.metadata()?.len();
        Ok(Box::new(FileBlobReader { file, size }))
    }

    fn stat(&self, blob_ref: &BlobRef) -> Result<BlobInfo> {
        let path = self.blob_path("blobs", blob_ref)?;
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::Io(e)
            }
        })?;
        Ok(BlobInfo {
            blob_ref: blob_ref.clone(),
            format_version: FormatVersion::V1,
            size: meta.len(),
            modified: meta.modified()?,
        })
    }

    fn delete(&self, blob_ref: &BlobRef) -> Result<()> {
        let path = self.blob_path("blobs", blob_ref)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn trash(&self, blob_ref: &BlobRef) -> Result<()> {
        let from = self.blob_path("blobs", blob_ref)?;
        let to = self.blob_path("trash", blob_ref)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&from, &to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn restore_trash(&self, namespace: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut restored = Vec::new();
        let mut moves = Vec::new();
        self.walk_area("trash", namespace, &mut |info| {
            moves.push(info.blob_ref);
            Ok(())
        })?;
        for blob_ref in moves {
            let from = self.blob_path("trash", &blob_ref)?;
            let to = self.blob_path("blobs", &blob_ref)?;
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&from, &to)?;
            restored.push(blob_ref.key);
        }
        debug!(namespace = %hex::encode(namespace), count = restored.len(), "trash restored");
        Ok(restored)
    }

    fn empty_trash(&self, namespace: &[u8], before: SystemTime) -> Result<(u64, Vec<Vec<u8>>)> {
        let mut bytes = 0u64;
        let mut keys = Vec::new();
        let mut victims = Vec::new();
        self.walk_area("trash", namespace, &mut |info| {
            if info.modified < before {
                victims.push((info.blob_ref, info.size));
            }
            Ok(())
        })?;
        for (blob_ref, size) in victims {
            let path = self.blob_path("trash", &blob_ref)?;
            fs::remove_file(&path)?;
            bytes += size;
            keys.push(blob_ref.key);
        }
        Ok((bytes, keys))
    }

    fn walk_namespace(
        &self,
        namespace: &[u8],
        walk: &mut dyn FnMut(BlobInfo) -> Result<()>,
    ) -> Result<()> {
        self.walk_area("blobs", namespace, walk)
    }

    fn list_namespaces(&self) -> Result<Vec<Vec<u8>>> {
        let mut namespaces = Vec::new();
        for entry in fs::read_dir(self.base.join("blobs"))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(ns) = hex::decode(entry.file_name().to_string_lossy().as_bytes()) {
                    namespaces.push(ns);
                }
            }
        }
        Ok(namespaces)
    }

    fn space_used_in_namespace(&self, namespace: &[u8]) -> Result<u64> {
        let mut total = 0u64;
        self.walk_area("blobs", namespace, &mut |info| {
            total += info.size;
            Ok(())
        })?;
        Ok(total)
    }

    fn free_space(&self) -> Result<u64> {
        let path = std::ffi::CString::new(self.base.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::InvalidBlobRef("base path contains NUL".to_string()))?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(stats.f_bavail as u64 * stats.f_bsize as u64)
    }

    fn delete_namespace(&self, namespace: &[u8]) -> Result<()> {
        let dir = self.base.join("blobs").join(hex::encode(namespace));
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_trash_namespace(&self, namespace: &[u8]) -> Result<()> {
        let dir = self.base.join("trash").join(hex::encode(namespace));
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn check_writability(&self) -> Result<()> {
        let probe = self.base.join("write-test");
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;
        Ok(())
    }

    fn create_verification_file(&self, id: &NodeId) -> Result<()> {
        fs::write(self.base.join(VERIFICATION_FILE), id.as_bytes())?;
        Ok(())
    }

    fn verify_storage_dir(&self, id: &NodeId) -> Result<()> {
        let content = fs::read(self.base.join(VERIFICATION_FILE))
            .map_err(|e| Error::VerificationFailed(format!("missing verification file: {e}")))?;
        if content != id.as_bytes() {
            return Err(Error::VerificationFailed(
                "verification file names a different node".to_string(),
            ));
        }
        Ok(())
    }
}
