//! The on-disk hash table.
//!
//! One file per database: a 4096-byte header page followed by `2^lrec`
//! 64-byte records. The header carries the `HTBL` magic, a big-endian u32
//! creation timestamp, zero padding, and a trailing big-endian u64 xxh3 over
//! the first 4088 bytes. The per-record fields are little-endian; the header
//! integers are big-endian, and both layouts are locked by tests.
//!
//! Lookups probe linearly from `key_index(key) & mask`. A torn page write
//! leaves up to a page of invalid records, so lookups keep probing through
//! invalid slots for one full page before concluding a key is absent.
//! Inserts hold the exclusive operation lock; lookups and ranges share it.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::record::{
    key_index, max_expiration, Expiration, Key, Page, Record, PAGE_SIZE, RECORDS_PER_PAGE,
    RECORD_SIZE,
};

const MAGIC: &[u8; 4] = b"HTBL";

/// Minimum table size: one page of records.
pub const MIN_LREC: u64 = 6;

#[derive(Debug)]
pub struct HashTbl {
    file: File,
    lrec: u64,
    nrec: u64,
    mask: u64,
    created: u32,

    /// Exclusive for insert and expiration rewrites, shared for lookup/range.
    op_mu: RwLock<()>,

    /// Protects the estimates and the single cached page.
    state: Mutex<TblState>,
}

#[derive(Debug)]
struct TblState {
    nset: u64,
    alive: u64,
    /// Index of the cached page, u64::MAX when nothing is cached.
    page_index: u64,
    page: Page,
}

fn write_header(file: &File, created: u32) -> Result<()> {
    let mut buf = [0u8; PAGE_SIZE];
    buf[0..4].copy_from_slice(MAGIC);
    buf[4..8].copy_from_slice(&created.to_be_bytes());
    let hash = xxh3_64(&buf[..PAGE_SIZE - 8]);
    buf[PAGE_SIZE - 8..].copy_from_slice(&hash.to_be_bytes());
    file.write_all_at(&buf, 0)?;
    Ok(())
}

fn read_header(file: &File) -> Result<u32> {
    let mut buf = [0u8; PAGE_SIZE];
    file.read_exact_at(&mut buf, 0)
        .map_err(|e| Error::InvalidTableHeader(format!("unable to read header: {e}")))?;
    if &buf[0..4] != MAGIC {
        return Err(Error::InvalidTableHeader(format!(
            "bad magic: {:?}",
            &buf[0..4]
        )));
    }
    let stored = u64::from_be_bytes(buf[PAGE_SIZE - 8..].try_into().unwrap());
    let computed = xxh3_64(&buf[..PAGE_SIZE - 8]);
    if stored != computed {
        return Err(Error::InvalidTableHeader(format!(
            "checksum mismatch: {stored:x} != {computed:x}"
        )));
    }
    Ok(u32::from_be_bytes(buf[4..8].try_into().unwrap()))
}

impl HashTbl {
    /// Create a fresh table of `2^lrec` records, truncating whatever was in
    /// the file before.
    pub fn create(path: &Path, lrec: u64, created: u32) -> Result<HashTbl> {
        let lrec = lrec.max(MIN_LREC);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let size = PAGE_SIZE as u64 + (1u64 << lrec) * RECORD_SIZE as u64;
        file.set_len(0)?;
        file.set_len(size)?;
        write_header(&file, created)?;
        Self::open_file(file)
    }

    /// Open an existing table, recomputing `lrec` from the file size.
    pub fn open(path: &Path) -> Result<HashTbl> {
        let file = File::options().read(true).write(true).open(path)?;
        Self::open_file(file)
    }

    fn open_file(file: File) -> Result<HashTbl> {
        let size = file.metadata()?.len();
        if size < (PAGE_SIZE + PAGE_SIZE) as u64 {
            return Err(Error::TableTooSmall(size));
        }

        let lrec = 63 - ((size - PAGE_SIZE as u64) / RECORD_SIZE as u64).leading_zeros() as u64;
        if PAGE_SIZE as u64 + (1u64 << lrec) * RECORD_SIZE as u64 != size {
            return Err(Error::TableSizeMismatch { size, lrec });
        }

        let created = read_header(&file)?;

        let tbl = HashTbl {
            file,
            lrec,
            nrec: 1 << lrec,
            mask: (1 << lrec) - 1,
            created,
            op_mu: RwLock::new(()),
            state: Mutex::new(TblState {
                nset: 0,
                alive: 0,
                page_index: u64::MAX,
                page: Page::zeroed(),
            }),
        };

        let (nset, alive) = tbl.compute_estimates()?;
        {
            let mut state = tbl.state.lock().unwrap();
            state.nset = nset;
            state.alive = alive;
        }

        Ok(tbl)
    }

    pub fn lrec(&self) -> u64 {
        self.lrec
    }

    pub fn nrec(&self) -> u64 {
        self.nrec
    }

    pub fn created(&self) -> u32 {
        self.created
    }

    /// Estimated number of set records and sum of their lengths.
    pub fn estimates(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.nset, state.alive)
    }

    /// Estimated fraction of slots occupied.
    pub fn load(&self) -> f64 {
        let state = self.state.lock().unwrap();
        state.nset as f64 / self.nrec as f64
    }

    fn slot_page(&self, n: u64) -> (u64, u64) {
        (n / RECORDS_PER_PAGE, n % RECORDS_PER_PAGE)
    }

    /// Read slot `n` through the page cache. The cache is invalidated before
    /// any read so an error never leaves a stale page behind.
    fn read_record(&self, n: u64) -> Result<Record> {
        let mut state = self.state.lock().unwrap();
        let (pi, ri) = self.slot_page(n);
        if state.page_index != pi {
            state.page_index = u64::MAX;
            let offset = PAGE_SIZE as u64 + pi * PAGE_SIZE as u64;
            self.file.read_exact_at(&mut state.page.0, offset)?;
            state.page_index = pi;
        }
        Ok(state.page.read_record(ri))
    }

    /// Write slot `n`, keeping the cached page coherent. The checksum is
    /// always recomputed before serializing.
    fn write_record(&self, n: u64, mut rec: Record) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let (pi, ri) = self.slot_page(n);

        rec.set_checksum();
        let mut buf = [0u8; RECORD_SIZE];
        rec.write_to(&mut buf);

        let offset = PAGE_SIZE as u64 + n * RECORD_SIZE as u64;
        let result = self.file.write_all_at(&buf, offset);

        if pi == state.page_index {
            match result {
                Ok(()) => state.page.write_record(ri, &rec),
                // unknown page state on disk, drop the cache
                Err(_) => state.page_index = u64::MAX,
            }
        }

        result.map_err(Error::from)
    }

    /// Sample up to 256 pages worth of records and scale. The table is a
    /// power of two so the factor divides evenly.
    fn compute_estimates(&self) -> Result<(u64, u64)> {
        let sample = (RECORDS_PER_PAGE * 256).min(self.nrec);

        let mut nset = 0u64;
        let mut alive = 0u64;
        for n in 0..sample {
            let rec = self.read_record(n)?;
            if rec.valid_checksum() {
                nset += 1;
                alive += rec.length as u64;
            }
        }

        let factor = self.nrec / sample;
        Ok((nset * factor, alive * factor))
    }

    /// Find the record for `key`. Probes through invalid records for up to a
    /// full page before giving up, tolerating one torn page write.
    pub fn lookup(&self, key: &Key) -> Result<Option<Record>> {
        let _op = self.op_mu.read().unwrap();

        let mut n = key_index(key) & self.mask;
        for i in 0..self.nrec {
            let rec = self.read_record(n)?;
            if !rec.valid_checksum() {
                if i < RECORDS_PER_PAGE {
                    n = (n + 1) & self.mask;
                    continue;
                }
                return Ok(None);
            }
            if rec.key == *key {
                return Ok(Some(rec));
            }
            n = (n + 1) & self.mask;
        }
        Ok(None)
    }

    /// Insert a record, merging with an existing record for the same key.
    /// Returns `TableFull` if every slot is occupied by other keys, and
    /// `RecordCollision` if a same-key record differs outside of the
    /// expiration field.
    pub fn insert(&self, mut rec: Record) -> Result<()> {
        let _op = self.op_mu.write().unwrap();

        let mut n = rec.index() & self.mask;
        for _ in 0..self.nrec {
            let existing = self.read_record(n)?;
            let valid = existing.valid_checksum();

            if valid {
                if existing.key != rec.key {
                    n = (n + 1) & self.mask;
                    continue;
                }
                if !rec.equalish(&existing) {
                    return Err(Error::RecordCollision {
                        put: rec.to_string(),
                        exist: existing.to_string(),
                    });
                }
                rec.expires = max_expiration(rec.expires, existing.expires);
            }

            self.write_record(n, rec)?;

            let mut state = self.state.lock().unwrap();
            state.alive += rec.length as u64;
            if !valid {
                state.nset += 1;
            } else {
                // same key update: subtract the old length, saturating
                state.alive = state.alive.saturating_sub(existing.length as u64);
            }
            return Ok(());
        }

        Err(Error::TableFull)
    }

    /// Rewrite the expiration of an existing record in place. Used by the
    /// delete, trash, and restore paths. Returns whether the key was found.
    pub fn set_expiration(&self, key: &Key, expires: Expiration) -> Result<bool> {
        let _op = self.op_mu.write().unwrap();

        let mut n = key_index(key) & self.mask;
        for i in 0..self.nrec {
            let rec = self.read_record(n)?;
            if !rec.valid_checksum() {
                if i < RECORDS_PER_PAGE {
                    n = (n + 1) & self.mask;
                    continue;
                }
                return Ok(false);
            }
            if rec.key == *key {
                let mut updated = rec;
                updated.expires = expires;
                self.write_record(n, updated)?;
                return Ok(true);
            }
            n = (n + 1) & self.mask;
        }
        Ok(false)
    }

    /// Iterate all valid records in table order. A full scan leaves the
    /// estimates exact. The callback returns whether to continue.
    pub fn range<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<bool>,
    {
        let _op = self.op_mu.read().unwrap();

        let mut nset = 0u64;
        let mut alive = 0u64;
        for n in 0..self.nrec {
            let rec = self.read_record(n)?;
            if !rec.valid_checksum() {
                continue;
            }
            nset += 1;
            alive += rec.length as u64;
            if !f(&rec)? {
                return Ok(());
            }
        }

        let mut state = self.state.lock().unwrap();
        state.nset = nset;
        state.alive = alive;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_tbl(dir: &TempDir, lrec: u64) -> HashTbl {
        HashTbl::create(&dir.path().join("hashtbl"), lrec, 12345).unwrap()
    }

    fn rec_for(key: Key, length: u32) -> Record {
        let mut rec = Record {
            key,
            offset: 0,
            log: 1,
            length,
            created: 100,
            expires: Expiration(0),
            checksum: 0,
        };
        rec.set_checksum();
        rec
    }

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashtbl");
        {
            let tbl = HashTbl::create(&path, 8, 777).unwrap();
            assert_eq!(tbl.nrec(), 256);
            assert_eq!(tbl.created(), 777);
        }
        let tbl = HashTbl::open(&path).unwrap();
        assert_eq!(tbl.lrec(), 8);
        assert_eq!(tbl.created(), 777);
    }

    #[test]
    fn test_open_rejects_bad_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashtbl");
        let tbl = HashTbl::create(&path, 8, 0).unwrap();
        drop(tbl);

        // grow the file so size != pSize + 2^lrec * rSize
        let file = File::options().write(true).open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size + 64).unwrap();
        drop(file);

        match HashTbl::open(&path) {
            Err(Error::TableSizeMismatch { .. }) => {}
            other => panic!("expected size mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_open_rejects_too_small() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashtbl");
        std::fs::write(&path, vec![0u8; PAGE_SIZE]).unwrap();
        match HashTbl::open(&path) {
            Err(Error::TableTooSmall(_)) => {}
            other => panic!("expected too small, got {other:?}"),
        }
    }

    #[test]
    fn test_open_rejects_corrupt_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashtbl");
        let tbl = HashTbl::create(&path, 8, 0).unwrap();
        drop(tbl);

        let file = File::options().write(true).open(&path).unwrap();
        file.write_all_at(b"XXXX", 0).unwrap();
        drop(file);

        match HashTbl::open(&path) {
            Err(Error::InvalidTableHeader(_)) => {}
            other => panic!("expected header error, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_lookup() {
        let dir = TempDir::new().unwrap();
        let tbl = new_tbl(&dir, 8);

        let rec = rec_for([1u8; 32], 512);
        tbl.insert(rec).unwrap();

        let found = tbl.lookup(&[1u8; 32]).unwrap().unwrap();
        assert_eq!(found, rec);
        assert!(tbl.lookup(&[2u8; 32]).unwrap().is_none());
    }

    #[test]
    fn test_insert_many_and_range() {
        let dir = TempDir::new().unwrap();
        let tbl = new_tbl(&dir, 8);

        for i in 0..100u8 {
            tbl.insert(rec_for([i; 32], i as u32)).unwrap();
        }

        let mut seen = 0;
        tbl.range(|_| {
            seen += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, 100);

        // full range updates estimates exactly
        let (nset, alive) = tbl.estimates();
        assert_eq!(nset, 100);
        assert_eq!(alive, (0..100u64).sum::<u64>());
    }

    #[test]
    fn test_range_returns_at_most_one_record_per_key() {
        let dir = TempDir::new().unwrap();
        let tbl = new_tbl(&dir, 8);

        let rec = rec_for([5u8; 32], 100);
        tbl.insert(rec).unwrap();
        tbl.insert(rec).unwrap();
        tbl.insert(rec).unwrap();

        let mut count = 0;
        tbl.range(|r| {
            if r.key == [5u8; 32] {
                count += 1;
            }
            Ok(true)
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_insert_merge_takes_sticky_trash() {
        let dir = TempDir::new().unwrap();
        let tbl = new_tbl(&dir, 8);

        let mut trashed = rec_for([9u8; 32], 64);
        trashed.expires = Expiration::new(50, true);
        trashed.set_checksum();
        tbl.insert(trashed).unwrap();

        let mut live = rec_for([9u8; 32], 64);
        live.expires = Expiration::new(10, false);
        live.set_checksum();
        tbl.insert(live).unwrap();

        let found = tbl.lookup(&[9u8; 32]).unwrap().unwrap();
        assert!(found.expires.trash());
        assert_eq!(found.expires.days(), 50);
    }

    #[test]
    fn test_insert_merge_unset_expiration_revives() {
        let dir = TempDir::new().unwrap();
        let tbl = new_tbl(&dir, 8);

        let mut trashed = rec_for([9u8; 32], 64);
        trashed.expires = Expiration::new(50, true);
        trashed.set_checksum();
        tbl.insert(trashed).unwrap();

        // re-upload with no expiration clears the deadline entirely
        tbl.insert(rec_for([9u8; 32], 64)).unwrap();
        let found = tbl.lookup(&[9u8; 32]).unwrap().unwrap();
        assert!(!found.expires.is_set());
    }

    #[test]
    fn test_insert_collision_on_field_mismatch() {
        let dir = TempDir::new().unwrap();
        let tbl = new_tbl(&dir, 8);

        tbl.insert(rec_for([3u8; 32], 64)).unwrap();

        let mut other = rec_for([3u8; 32], 65);
        other.set_checksum();
        match tbl.insert(other) {
            Err(Error::RecordCollision { .. }) => {}
            other => panic!("expected collision, got {other:?}"),
        }
    }

    #[test]
    fn test_set_expiration() {
        let dir = TempDir::new().unwrap();
        let tbl = new_tbl(&dir, 8);

        tbl.insert(rec_for([4u8; 32], 64)).unwrap();
        let updated = tbl
            .set_expiration(&[4u8; 32], Expiration::new(30, true))
            .unwrap();
        assert!(updated);

        let found = tbl.lookup(&[4u8; 32]).unwrap().unwrap();
        assert!(found.expires.trash());
        assert!(found.valid_checksum());

        let missing = tbl
            .set_expiration(&[99u8; 32], Expiration::new(30, true))
            .unwrap();
        assert!(!missing);
    }

    #[test]
    fn test_lookup_probes_through_invalid_records() {
        // Insert a key, corrupt its record on disk, then verify that a second
        // key probing through the same region is still found.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashtbl");
        let tbl = HashTbl::create(&path, 8, 0).unwrap();

        // find two keys that hash to the same slot
        let base_slot = key_index(&[1u8; 32]) & ((1 << 8) - 1);
        let mut second = None;
        for i in 2..=255u8 {
            let key = [i; 32];
            if key_index(&key) & ((1 << 8) - 1) == base_slot {
                second = Some(key);
                break;
            }
        }
        // keys are uniform, so with 254 candidates and 256 slots this can
        // miss; fall back to a key one slot earlier which probes through too
        let second = second.unwrap_or_else(|| {
            for i in 2..=255u8 {
                let key = [i; 32];
                if key_index(&key) & ((1 << 8) - 1) == (base_slot.wrapping_sub(1) & 255) {
                    return key;
                }
            }
            panic!("no colliding key found");
        });

        tbl.insert(rec_for([1u8; 32], 64)).unwrap();
        tbl.insert(rec_for(second, 64)).unwrap();
        drop(tbl);

        // zero the first key's record on disk
        let reopened = HashTbl::open(&path).unwrap();
        let mut slot_of_first = None;
        let mut n = base_slot;
        loop {
            let rec = reopened.read_record(n).unwrap();
            if rec.valid_checksum() && rec.key == [1u8; 32] {
                slot_of_first = Some(n);
                break;
            }
            n = (n + 1) & 255;
        }
        let slot = slot_of_first.unwrap();
        drop(reopened);

        let file = File::options().write(true).open(&path).unwrap();
        file.write_all_at(
            &[0u8; RECORD_SIZE],
            PAGE_SIZE as u64 + slot * RECORD_SIZE as u64,
        )
        .unwrap();
        drop(file);

        let tbl = HashTbl::open(&path).unwrap();
        assert!(tbl.lookup(&[1u8; 32]).unwrap().is_none());
        // probe continues past the invalid record for up to a page
        assert!(tbl.lookup(&second).unwrap().is_some());
    }

    #[test]
    fn test_load_factor() {
        let dir = TempDir::new().unwrap();
        let tbl = new_tbl(&dir, 6); // 64 slots

        for i in 0..32u8 {
            tbl.insert(rec_for([i; 32], 1)).unwrap();
        }
        assert!((tbl.load() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_estimates_on_open_small_table_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashtbl");
        let tbl = HashTbl::create(&path, 8, 0).unwrap();
        for i in 0..10u8 {
            tbl.insert(rec_for([i; 32], 100)).unwrap();
        }
        drop(tbl);

        // 256 slots < 256 pages, so the open-time sample covers everything
        let tbl = HashTbl::open(&path).unwrap();
        let (nset, alive) = tbl.estimates();
        assert_eq!(nset, 10);
        assert_eq!(alive, 1000);
    }
}
