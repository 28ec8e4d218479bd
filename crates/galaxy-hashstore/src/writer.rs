//! Piece writer state machine: Open -> Writing -> {Committed | Cancelled}.
//!
//! Data is written past the log's durable tail; nothing becomes visible
//! until `commit` appends the index record and publishes it in the hash
//! table. Cancelling (or dropping) the writer leaves the durable tail where
//! it was, so the bytes are overwritten by the next append.

use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::logfile::LogFile;
use crate::record::{Record, RECORD_SIZE};

pub struct Writer {
    db: Arc<DbInner>,
    lf: Arc<LogFile>,
    rec: Record,
    finished: bool,
}

impl Writer {
    pub(crate) fn new(db: Arc<DbInner>, lf: Arc<LogFile>, rec: Record) -> Writer {
        Writer {
            db,
            lf,
            rec,
            finished: false,
        }
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.rec.length as u64
    }

    /// Append bytes to the piece. Fails with `PieceTooLarge` once the piece
    /// would exceed what the record's 32-bit length can hold.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::WriterFinished);
        }
        if self.rec.length as u64 + data.len() as u64 > u32::MAX as u64 {
            return Err(Error::PieceTooLarge);
        }

        let offset = self.rec.offset + self.rec.length as u64;
        self.lf.file.write_all_at(data, offset)?;
        self.rec.length += data.len() as u32;
        Ok(())
    }

    /// Publish the piece: write alignment padding and the index record, move
    /// the durable tail, and insert the record into the hash table. On a
    /// record write failure the tail stays put and the data bytes are
    /// reclaimed by the next append.
    pub fn commit(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let result = self.commit_inner();
        self.db.release_log(self.lf.id);
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        let after_data = self.rec.offset + self.rec.length as u64;
        let padding = LogFile::alignment_padding(after_data);

        let mut written = 0u64;
        if padding > 0 {
            self.lf
                .file
                .write_all_at(&vec![0u8; padding as usize], after_data)?;
            written += padding;
        }

        self.rec.set_checksum();
        let mut buf = [0u8; RECORD_SIZE];
        self.rec.write_to(&mut buf);
        self.lf.file.write_all_at(&buf, after_data + written)?;
        written += RECORD_SIZE as u64;

        self.lf.advance(self.rec.length as u64 + written);

        let tbl = self.db.tbl.read().unwrap();
        tbl.insert(self.rec)
    }

    /// Discard the piece. The durable tail does not move, so the space is
    /// reclaimed by the next writer on this log.
    pub fn cancel(mut self) {
        self.finished = true;
        self.db.release_log(self.lf.id);
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.db.release_log(self.lf.id);
        }
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write_all(self, buf).map_err(|e| match e {
            Error::Io(io) => io,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
