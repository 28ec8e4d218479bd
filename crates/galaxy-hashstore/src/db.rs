//! A hashstore database: one directory holding append-only `log-*` files and
//! a single `hashtbl` index.
//!
//! ## Layout
//!
//! ```text
//! {dir}/
//!   hashtbl          4096-byte header + 2^lrec records
//!   log-0000000001   {piece bytes, 512B footer}, pad, 64B record, ...
//!   log-0000000002
//! ```
//!
//! ## Crash model
//!
//! The durable tail of a log is the end of its last indexed record group,
//! recovered on open from the hash table. A crash between writing piece data
//! and writing the index record leaves bytes past the tail; the next writer
//! for that log starts at the tail and overwrites them.
//!
//! ## Trash and expiration
//!
//! Expired live records read as absent and are dropped at compaction.
//! Trashed records read as absent unless a restore window is active, in
//! which case the read revives the record and reports `trash = true` so the
//! caller knows the piece came back from the dead.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::logfile::{LogFile, LogReader};
use crate::record::{days_since_epoch, Expiration, Key, Record};
use crate::writer::Writer;

/// Compact once the table is more than three quarters full.
const COMPACT_LOAD: f64 = 0.75;

/// Fresh tables get 2^14 slots; compaction sizes for a quarter-full table.
const INITIAL_LREC: u64 = 14;

/// Days a trashed piece stays restorable before compaction drops it.
pub const TRASH_TTL_DAYS: u32 = 7;

/// Callback deciding whether a key should be flagged as trash during
/// compaction. Driven by the garbage-collection bloom filter.
pub type ShouldTrashFn = dyn Fn(&Key, DateTime<Utc>) -> bool + Send + Sync;

/// Returns the most recent restore request for this database, if any.
pub type LastRestoreFn = dyn Fn() -> Option<DateTime<Utc>> + Send + Sync;

pub struct Db {
    inner: Arc<DbInner>,
}

pub(crate) struct DbInner {
    dir: PathBuf,
    pub(crate) tbl: RwLock<crate::hashtbl::HashTbl>,
    pub(crate) logs: Mutex<LogsState>,
    should_trash: Option<Box<ShouldTrashFn>>,
    last_restore: Option<Box<LastRestoreFn>>,
}

pub(crate) struct LogsState {
    pub(crate) logs: HashMap<u64, Arc<LogFile>>,
    /// Log ids not currently owned by a writer, available for appends.
    pub(crate) available: Vec<u64>,
    pub(crate) next_id: u64,
}

fn log_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("log-{id:010}"))
}

fn parse_log_id(name: &str) -> Option<u64> {
    name.strip_prefix("log-")?.parse().ok()
}

impl Db {
    /// Open or create a database in `dir`.
    pub fn open(
        dir: impl Into<PathBuf>,
        should_trash: Option<Box<ShouldTrashFn>>,
        last_restore: Option<Box<LastRestoreFn>>,
    ) -> Result<Db> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let tbl_path = dir.join("hashtbl");
        let tbl = if tbl_path.exists() {
            crate::hashtbl::HashTbl::open(&tbl_path)?
        } else {
            let created = days_since_epoch(Utc::now().timestamp());
            crate::hashtbl::HashTbl::create(&tbl_path, INITIAL_LREC, created)?
        };

        // recover each log's durable tail from the table
        let mut tails: HashMap<u64, u64> = HashMap::new();
        tbl.range(|rec| {
            let tail = LogFile::record_tail(rec);
            let entry = tails.entry(rec.log).or_insert(0);
            if tail > *entry {
                *entry = tail;
            }
            Ok(true)
        })?;

        let mut logs = HashMap::new();
        let mut available = Vec::new();
        let mut next_id = 1u64;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = parse_log_id(&name.to_string_lossy()) else {
                continue;
            };
            let path = log_path(&dir, id);
            let file = File::options().read(true).write(true).open(&path)?;
            let size = tails.get(&id).copied().unwrap_or(0);
            logs.insert(id, LogFile::new(file, id, path, size));
            available.push(id);
            next_id = next_id.max(id + 1);
        }

        let (nset, alive) = tbl.estimates();
        info!(
            dir = %dir.display(),
            logs = logs.len(),
            nset,
            alive,
            "hashstore opened"
        );

        Ok(Db {
            inner: Arc::new(DbInner {
                dir,
                tbl: RwLock::new(tbl),
                logs: Mutex::new(LogsState {
                    logs,
                    available,
                    next_id,
                }),
                should_trash,
                last_restore,
            }),
        })
    }

    /// Estimated number of live pieces and their total bytes.
    pub fn estimates(&self) -> (u64, u64) {
        self.inner.tbl.read().unwrap().estimates()
    }

    /// Fraction of the hash table in use.
    pub fn load(&self) -> f64 {
        self.inner.tbl.read().unwrap().load()
    }

    /// Start writing a piece. The writer must be committed or cancelled.
    pub fn create(&self, key: Key, expires: Option<DateTime<Utc>>) -> Result<Writer> {
        let lf = self.acquire_log()?;
        let expiration = match expires {
            Some(t) => Expiration::new(days_since_epoch(t.timestamp()), false),
            None => Expiration(0),
        };
        let rec = Record {
            key,
            offset: lf.size(),
            log: lf.id,
            length: 0,
            created: days_since_epoch(Utc::now().timestamp()),
            expires: expiration,
            checksum: 0,
        };
        Ok(Writer::new(self.inner.clone(), lf, rec))
    }

    /// Open a piece for reading. Expired and (un-restorable) trashed pieces
    /// read as absent. A trashed piece under an active restore window is
    /// revived and served with `trash = true`.
    pub fn read(&self, key: &Key) -> Result<Option<LogReader>> {
        let rec = {
            let tbl = self.inner.tbl.read().unwrap();
            tbl.lookup(key)?
        };
        let Some(rec) = rec else {
            return Ok(None);
        };

        let today = days_since_epoch(Utc::now().timestamp());
        let mut served_from_trash = false;
        if rec.expires.is_set() {
            if rec.expires.trash() {
                let restore_active = self
                    .inner
                    .last_restore
                    .as_ref()
                    .and_then(|f| f())
                    .is_some();
                if !restore_active {
                    return Ok(None);
                }
                // revive: clear the deadline so compaction keeps the piece
                let tbl = self.inner.tbl.read().unwrap();
                tbl.set_expiration(key, Expiration(0))?;
                served_from_trash = true;
                debug!(key = %hex::encode(&key[..8]), "piece restored from trash");
            } else if today >= rec.expires.days() {
                return Ok(None);
            }
        }

        let lf = {
            let logs = self.inner.logs.lock().unwrap();
            logs.logs.get(&rec.log).cloned()
        };
        let Some(lf) = lf else {
            warn!(log = rec.log, "record points at missing log file");
            return Ok(None);
        };
        if !lf.acquire() {
            return Ok(None);
        }
        Ok(Some(LogReader::new(lf, rec, served_from_trash)))
    }

    /// Delete a piece: its record expires immediately and compaction drops
    /// it. Unknown keys are fine.
    pub fn delete(&self, key: &Key) -> Result<()> {
        let today = days_since_epoch(Utc::now().timestamp());
        let tbl = self.inner.tbl.read().unwrap();
        tbl.set_expiration(key, Expiration::new(today, false))?;
        Ok(())
    }

    /// Move a piece to the trash: restorable for `TRASH_TTL_DAYS`.
    pub fn trash(&self, key: &Key) -> Result<bool> {
        let today = days_since_epoch(Utc::now().timestamp());
        let tbl = self.inner.tbl.read().unwrap();
        tbl.set_expiration(key, Expiration::new(today + TRASH_TTL_DAYS, true))
    }

    /// Iterate all live records. The callback decides whether to continue.
    pub fn range<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<bool>,
    {
        self.inner.tbl.read().unwrap().range(f)
    }

    /// Whether the load factor calls for a compaction.
    pub fn should_compact(&self) -> bool {
        self.load() > COMPACT_LOAD
    }

    /// Rewrite the hash table, dropping expired live records and trashed
    /// records past their deadline, applying the trash decision callback to
    /// survivors, and removing logs that no longer hold live pieces. The
    /// insert merge semantics carry over because every surviving record is
    /// copied verbatim apart from its expiration.
    pub fn compact(&self, now: DateTime<Utc>) -> Result<()> {
        let today = days_since_epoch(now.timestamp());

        let mut tbl = self.inner.tbl.write().unwrap();

        let mut survivors: Vec<Record> = Vec::new();
        tbl.range(|rec| {
            if rec.expires.is_set() {
                if rec.expires.trash() {
                    if today > rec.expires.days() {
                        return Ok(true); // trash deadline passed
                    }
                } else if today >= rec.expires.days() {
                    return Ok(true); // expired
                }
            }
            let mut keep = *rec;
            if !keep.expires.trash() {
                if let Some(should_trash) = &self.inner.should_trash {
                    if should_trash(&keep.key, now) {
                        keep.expires = Expiration::new(today + TRASH_TTL_DAYS, true);
                    }
                }
            }
            survivors.push(keep);
            Ok(true)
        })?;

        // size the new table for a quarter-full load
        let needed = (survivors.len() as u64 * 4).max(1);
        let lrec = (64 - needed.leading_zeros() as u64).max(INITIAL_LREC);

        let tmp_path = self.inner.dir.join("hashtbl-tmp");
        let new_tbl = crate::hashtbl::HashTbl::create(&tmp_path, lrec, today)?;
        for rec in &survivors {
            new_tbl.insert(*rec)?;
        }
        std::fs::rename(&tmp_path, self.inner.dir.join("hashtbl"))?;
        let nset = survivors.len();
        *tbl = new_tbl;
        drop(tbl);

        // remove logs with no surviving records
        let live_logs: std::collections::HashSet<u64> =
            survivors.iter().map(|r| r.log).collect();
        let mut logs = self.inner.logs.lock().unwrap();
        let dead: Vec<u64> = logs
            .logs
            .keys()
            .copied()
            .filter(|id| !live_logs.contains(id) && logs.available.contains(id))
            .collect();
        for id in dead {
            if let Some(lf) = logs.logs.remove(&id) {
                lf.remove();
            }
            logs.available.retain(|l| *l != id);
        }

        info!(records = nset, logs = logs.logs.len(), "hashstore compacted");
        Ok(())
    }

    /// Pick the fullest available log, or create a new one.
    fn acquire_log(&self) -> Result<Arc<LogFile>> {
        let mut logs = self.inner.logs.lock().unwrap();
        if let Some(pos) = (0..logs.available.len()).max_by_key(|i| {
            let id = logs.available[*i];
            logs.logs.get(&id).map(|l| l.size()).unwrap_or(0)
        }) {
            let id = logs.available.swap_remove(pos);
            return Ok(logs.logs[&id].clone());
        }

        let id = logs.next_id;
        logs.next_id += 1;
        let path = log_path(&self.inner.dir, id);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let lf = LogFile::new(file, id, path, 0);
        logs.logs.insert(id, lf.clone());
        Ok(lf)
    }
}

impl DbInner {
    /// Return a log to the available pool after a writer finishes.
    pub(crate) fn release_log(&self, id: u64) {
        let mut logs = self.logs.lock().unwrap();
        if logs.logs.contains_key(&id) && !logs.available.contains(&id) {
            logs.available.push(id);
        }
    }
}
