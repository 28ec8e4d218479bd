//! The piece backend.
//!
//! Minimal surface the piecestore endpoint needs: open a writer, open a
//! reader, delete, existence-check, and start a trash restore. The hashstore
//! implementation keeps one database per satellite namespace under a shared
//! root directory.
//!
//! Every committed piece carries a 512-byte footer: a big-endian u16 length
//! prefix followed by the marshalled `PieceHeader` (hash algorithm, hash,
//! creation time, order limit, signature). Readers subtract the footer from
//! the reported size and parse it on demand for repair and audit downloads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use galaxy_core::{NodeId, PieceHashAlgorithm, PieceId};
use galaxy_hashstore::{Db, LogReader, FOOTER_SIZE};
use galaxy_proto::piecestore::PieceHeader;
use prost::Message;
use sha2::Digest as _;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retain::{BloomFilterManager, RestoreTimeManager};

/// Incremental hash over uploaded piece bytes.
#[derive(Clone)]
pub enum PieceHasher {
    Sha256(sha2::Sha256),
    Sha3_256(sha3::Sha3_256),
}

impl PieceHasher {
    pub fn new(algorithm: PieceHashAlgorithm) -> Self {
        match algorithm {
            PieceHashAlgorithm::Sha256 => PieceHasher::Sha256(sha2::Sha256::new()),
            PieceHashAlgorithm::Sha3_256 => PieceHasher::Sha3_256(sha3::Sha3_256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            PieceHasher::Sha256(h) => h.update(data),
            PieceHasher::Sha3_256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            PieceHasher::Sha256(h) => h.finalize().to_vec(),
            PieceHasher::Sha3_256(h) => h.finalize().to_vec(),
        }
    }
}

/// Writes one piece; commit takes the header that becomes the footer.
pub struct PieceWriter {
    writer: galaxy_hashstore::Writer,
    hasher: PieceHasher,
    size: u64,
}

impl PieceWriter {
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.writer.write_all(data) {
            Ok(()) => {}
            Err(galaxy_hashstore::Error::PieceTooLarge) => return Err(Error::PieceTooLarge),
            Err(e) => return Err(e.into()),
        }
        self.hasher.update(data);
        self.size += data.len() as u64;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hash of everything written so far.
    pub fn hash(&self) -> Vec<u8> {
        self.hasher.clone().finalize()
    }

    /// Append the length-prefixed footer and commit the blob.
    pub fn commit(self, header: &PieceHeader) -> Result<()> {
        let mut writer = self.writer;
        let encoded = header.encode_to_vec();
        if encoded.len() > FOOTER_SIZE as usize - 2 {
            return Err(Error::HeaderTooLarge);
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        footer[0..2].copy_from_slice(&(encoded.len() as u16).to_be_bytes());
        footer[2..2 + encoded.len()].copy_from_slice(&encoded);

        writer.write_all(&footer)?;
        writer.commit()?;
        Ok(())
    }

    pub fn cancel(self) {
        self.writer.cancel();
    }
}

/// Reads one piece; the footer is hidden from the byte range.
pub struct PieceReader {
    reader: LogReader,
}

impl PieceReader {
    /// Piece content size, footer excluded.
    pub fn size(&self) -> u64 {
        self.reader.size().saturating_sub(FOOTER_SIZE)
    }

    pub fn trash(&self) -> bool {
        self.reader.trash()
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(size - offset) as usize;
        Ok(self.reader.read_at(&mut buf[..n], offset)?)
    }

    /// Parse the footer back into the original upload's header, proving
    /// provenance to repairers and auditors.
    pub fn header(&self) -> Result<PieceHeader> {
        let blob_size = self.reader.size();
        if blob_size < FOOTER_SIZE {
            return Err(Error::FooterTooSmall);
        }
        let mut footer = vec![0u8; FOOTER_SIZE as usize];
        let mut done = 0;
        while done < footer.len() {
            let n = self
                .reader
                .read_at(&mut footer[done..], blob_size - FOOTER_SIZE + done as u64)?;
            if n == 0 {
                return Err(Error::FooterTooSmall);
            }
            done += n;
        }
        let len = u16::from_be_bytes([footer[0], footer[1]]) as usize;
        if len > footer.len() - 2 {
            return Err(Error::FooterTooSmall);
        }
        Ok(PieceHeader::decode(&footer[2..2 + len])?)
    }
}

/// Piece backend over per-satellite hashstore databases.
pub struct HashStoreBackend {
    dir: PathBuf,
    bloom: Arc<BloomFilterManager>,
    restore: Arc<RestoreTimeManager>,
    dbs: Mutex<HashMap<NodeId, Arc<Db>>>,
}

impl HashStoreBackend {
    pub fn new(
        dir: impl Into<PathBuf>,
        bloom: Arc<BloomFilterManager>,
        restore: Arc<RestoreTimeManager>,
    ) -> Self {
        Self {
            dir: dir.into(),
            bloom,
            restore,
            dbs: Mutex::new(HashMap::new()),
        }
    }

    fn db(&self, satellite: NodeId) -> Result<Arc<Db>> {
        let mut dbs = self.dbs.lock().unwrap();
        if let Some(db) = dbs.get(&satellite) {
            return Ok(db.clone());
        }

        let bloom = self.bloom.clone();
        let restore = self.restore.clone();
        let db = Db::open(
            self.dir.join(satellite.to_string()),
            Some(Box::new(move |key, now| bloom.should_trash(satellite, key, now))),
            Some(Box::new(move || restore.restore_time(satellite))),
        )?;
        let db = Arc::new(db);
        dbs.insert(satellite, db.clone());
        Ok(db)
    }

    pub fn writer(
        &self,
        satellite: NodeId,
        piece: PieceId,
        algorithm: PieceHashAlgorithm,
        expires: Option<DateTime<Utc>>,
    ) -> Result<PieceWriter> {
        let db = self.db(satellite)?;
        let writer = db.create(*piece.as_bytes(), expires)?;
        Ok(PieceWriter {
            writer,
            hasher: PieceHasher::new(algorithm),
            size: 0,
        })
    }

    pub fn reader(&self, satellite: NodeId, piece: PieceId) -> Result<Option<PieceReader>> {
        let db = self.db(satellite)?;
        Ok(db
            .read(piece.as_bytes())?
            .map(|reader| PieceReader { reader }))
    }

    pub fn delete(&self, satellite: NodeId, piece: PieceId) -> Result<()> {
        let db = self.db(satellite)?;
        db.delete(piece.as_bytes())?;
        debug!(piece = %piece, "piece deleted");
        Ok(())
    }

    pub fn exists(&self, satellite: NodeId, piece: PieceId) -> Result<bool> {
        let db = self.db(satellite)?;
        Ok(db.read(piece.as_bytes())?.is_some())
    }

    /// Mark the whole namespace's trash for lazy restore from now on.
    pub fn start_restore(&self, satellite: NodeId) -> Result<()> {
        self.restore.set_restore_time(satellite, Utc::now());
        Ok(())
    }

    /// Total live bytes across all satellite namespaces.
    pub fn space_used(&self) -> u64 {
        let dbs = self.dbs.lock().unwrap();
        dbs.values().map(|db| db.estimates().1).sum()
    }

    /// Run compaction on any database over its load threshold.
    pub fn compact_if_needed(&self, now: DateTime<Utc>) -> Result<()> {
        let dbs: Vec<Arc<Db>> = self.dbs.lock().unwrap().values().cloned().collect();
        for db in dbs {
            if db.should_compact() {
                db.compact(now)?;
            }
        }
        Ok(())
    }
}
