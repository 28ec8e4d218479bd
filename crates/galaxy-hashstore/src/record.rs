//! On-disk record layout.
//!
//! The hash table stores fixed 64-byte records, 64 per 4096-byte page:
//!
//! ```text
//! key (32) | offset (6) | log (8) | length (4) | created-days (3) |
//! expires-days + trash-bit (3) | checksum (8)
//! ```
//!
//! Fields are little-endian. The checksum is `xxh3(bytes 0..56) >> 1`; the
//! top bit of the checksum stays reserved for a future flag. A record whose
//! checksum does not validate is treated as an empty slot.

use std::fmt;

use xxhash_rust::xxh3::xxh3_64;

/// Record size in bytes.
pub const RECORD_SIZE: usize = 64;
/// Page size in bytes. Records evenly divide the page.
pub const PAGE_SIZE: usize = 4096;
/// Records per page.
pub const RECORDS_PER_PAGE: u64 = (PAGE_SIZE / RECORD_SIZE) as u64;

const _: () = assert!(PAGE_SIZE % RECORD_SIZE == 0);

/// A piece key: 256 bits, uniformly distributed (piece ids are hashes).
pub type Key = [u8; 32];

/// Slot index for a key. Keys are already uniform so a cheap mix suffices.
pub fn key_index(key: &Key) -> u64 {
    xxh3_64(key)
}

/// Days since the unix epoch, truncating.
pub fn days_since_epoch(unix_secs: i64) -> u32 {
    (unix_secs / 86_400).max(0) as u32
}

/// Expiration encoding: 23 bits of days since epoch plus a trash flag in the
/// low bit. Zero means "no expiration set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expiration(pub u32);

impl Expiration {
    pub fn new(days: u32, trash: bool) -> Self {
        if trash {
            Expiration(days << 1 | 1)
        } else {
            Expiration(days << 1)
        }
    }

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    pub fn trash(&self) -> bool {
        self.0 & 1 == 1
    }

    pub fn days(&self) -> u32 {
        self.0 >> 1
    }
}

/// Merge two expirations: the trash flag is sticky, and between two of the
/// same kind the later deadline wins. If either side has no expiration, the
/// merge has no expiration: a record that once had no deadline must never
/// gain one by merging.
pub fn max_expiration(a: Expiration, b: Expiration) -> Expiration {
    if !a.is_set() || !b.is_set() {
        return Expiration(0);
    }
    if a.trash() && !b.trash() {
        return a;
    }
    if !a.trash() && b.trash() {
        return b;
    }
    if a.0 > b.0 {
        a
    } else {
        b
    }
}

/// One hash table entry describing where a piece lives in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Record {
    pub key: Key,
    /// 48 bits of offset into the log file (256 TB max file size).
    pub offset: u64,
    /// Log file id.
    pub log: u64,
    /// Length of the piece data including the footer (4 GB max).
    pub length: u32,
    /// 24 bits of days since epoch.
    pub created: u32,
    pub expires: Expiration,
    /// 63 bits of checksum, top bit reserved.
    pub checksum: u64,
}

impl Record {
    pub fn index(&self) -> u64 {
        key_index(&self.key)
    }

    pub fn compute_checksum(&self) -> u64 {
        let mut buf = [0u8; RECORD_SIZE];
        self.write_to(&mut buf);
        xxh3_64(&buf[..56]) >> 1
    }

    pub fn set_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn valid_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Serialize into a 64-byte buffer. Written in field order so the
    /// overlapping 3-byte fields land exactly like the on-disk layout.
    pub fn write_to(&self, buf: &mut [u8; RECORD_SIZE]) {
        buf[0..32].copy_from_slice(&self.key);
        buf[32..38].copy_from_slice(&(self.offset & 0xffff_ffff_ffff).to_le_bytes()[..6]);
        buf[38..46].copy_from_slice(&self.log.to_le_bytes());
        buf[46..50].copy_from_slice(&self.length.to_le_bytes());
        buf[50..53].copy_from_slice(&(self.created & 0xff_ffff).to_le_bytes()[..3]);
        buf[53..56].copy_from_slice(&(self.expires.0 & 0xff_ffff).to_le_bytes()[..3]);
        buf[56..64].copy_from_slice(&self.checksum.to_le_bytes());
    }

    pub fn read_from(buf: &[u8; RECORD_SIZE]) -> Record {
        let mut key = [0u8; 32];
        key.copy_from_slice(&buf[0..32]);

        let mut u64buf = [0u8; 8];
        u64buf[..6].copy_from_slice(&buf[32..38]);
        let offset = u64::from_le_bytes(u64buf);

        let log = u64::from_le_bytes(buf[38..46].try_into().unwrap());
        let length = u32::from_le_bytes(buf[46..50].try_into().unwrap());

        let mut u32buf = [0u8; 4];
        u32buf[..3].copy_from_slice(&buf[50..53]);
        let created = u32::from_le_bytes(u32buf);

        u32buf = [0u8; 4];
        u32buf[..3].copy_from_slice(&buf[53..56]);
        let expires = Expiration(u32::from_le_bytes(u32buf));

        let checksum = u64::from_le_bytes(buf[56..64].try_into().unwrap());

        Record {
            key,
            offset,
            log,
            length,
            created,
            expires,
            checksum,
        }
    }

    /// Equality with expiration and checksum masked out. Used by the insert
    /// merge: those two fields are the only ones allowed to differ.
    pub fn equalish(&self, other: &Record) -> bool {
        let mut a = *self;
        let mut b = *other;
        a.expires = Expiration(0);
        a.checksum = 0;
        b.expires = Expiration(0);
        b.checksum = 0;
        a == b
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{key:{} offset:{} log:{} length:{} created:{} expires:{} trash:{} checksum:{:x}}}",
            hex::encode(&self.key[..8]),
            self.offset,
            self.log,
            self.length,
            self.created,
            self.expires.days(),
            self.expires.trash(),
            self.checksum,
        )
    }
}

/// A 4 KiB page of records.
#[derive(Debug)]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    pub fn zeroed() -> Self {
        Page([0u8; PAGE_SIZE])
    }

    pub fn read_record(&self, n: u64) -> Record {
        let start = (n as usize * RECORD_SIZE) % PAGE_SIZE;
        let buf: &[u8; RECORD_SIZE] = self.0[start..start + RECORD_SIZE].try_into().unwrap();
        Record::read_from(buf)
    }

    pub fn write_record(&mut self, n: u64, rec: &Record) {
        let start = (n as usize * RECORD_SIZE) % PAGE_SIZE;
        let buf: &mut [u8; RECORD_SIZE] =
            (&mut self.0[start..start + RECORD_SIZE]).try_into().unwrap();
        rec.write_to(buf);
    }
}
