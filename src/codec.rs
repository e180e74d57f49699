//! The on-disk binary layout and the trait boundary the spool uses to serialize payloads.
//!
//! # Warning
//!
//! [`IndexHeader`] and [`IndexRecord`] are memory-mapped directly — their Rust layout *is* their
//! on-disk layout. Do not add, remove, reorder, or change the type of any field without bumping
//! [`INDEX_VERSION`] and adding a migration path; doing so silently changes what every existing
//! index file on disk means.

use std::{
    io::{self, Write},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Magic number identifying an index file, chosen to match the original Go proxy this crate
/// reimplements so that on-disk artifacts remain recognizable across ports.
pub const INDEX_MAGIC: u32 = 0x0001_e5ca;

/// Current on-disk version of the index header/record layout.
pub const INDEX_VERSION: u32 = 1;

/// Fixed header at the start of every `.index` file.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IndexHeader {
    /// Must equal [`INDEX_MAGIC`]; validated on open.
    pub magic: u32,
    /// Must equal [`INDEX_VERSION`]; validated on open.
    pub version: u32,
    /// Total number of record slots ever appended to this chunk.
    pub length: i64,
    /// Number of record slots whose `ttl > 0`.
    pub active_count: i64,
}

impl IndexHeader {
    /// A freshly-initialized header for a newly created chunk.
    pub fn new() -> Self {
        Self {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION,
            length: 0,
            active_count: 0,
        }
    }
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// One fixed-stride slot in the record array following [`IndexHeader`].
///
/// `offset` and `size` are immutable once appended; `ttl` and `last_try` are the only fields
/// mutated in place across retry passes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IndexRecord {
    /// Remaining delivery attempts. Reaching exactly `0` marks the record delivered or abandoned.
    pub ttl: i32,
    /// Nanoseconds since the Unix epoch of the most recent attempt (or of creation, if never
    /// attempted). Chosen as a portable, fixed-width encoding in place of the native clock
    /// representation the original Go proxy stores here; see `DESIGN.md` for the rationale.
    pub last_try: i64,
    /// Byte offset of this record's payload within the chunk's `.data` file.
    pub offset: i64,
    /// Length, in bytes, of this record's payload.
    pub size: i64,
}

impl IndexRecord {
    /// Returns the `last_try` field as a [`SystemTime`].
    pub fn last_try_time(&self) -> SystemTime {
        nanos_to_system_time(self.last_try)
    }
}

/// Converts a [`SystemTime`] to the `i64` nanoseconds-since-epoch encoding used on disk.
///
/// Saturates rather than panics for times before the epoch or far enough in the future to
/// overflow an `i64` count of nanoseconds (~year 2262); neither is a realistic wall-clock value
/// for this system, but a saturating conversion is preferable to a panic in code that runs on
/// every record mutation.
pub fn system_time_to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => i64::try_from(since_epoch.as_nanos()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

/// Converts the `i64` nanoseconds-since-epoch on-disk encoding back to a [`SystemTime`].
pub fn nanos_to_system_time(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

/// An opaque payload the spool can durably persist without understanding its contents.
///
/// The spool only ever calls [`Data::save`] once, immediately followed by [`Data::close`],
/// regardless of whether the save succeeded. Implementations backing a buffered HTTP request body
/// should use `close` to release that buffer.
pub trait Data: Send {
    /// Writes this payload's self-contained byte representation to `writer` and returns the
    /// number of bytes written.
    ///
    /// Implementations should write exactly what a later `Attempt` will need to reconstruct the
    /// original request; the spool records only the resulting offset and length.
    fn save(&mut self, writer: &mut dyn Write) -> io::Result<usize>;

    /// Releases any resources (buffers, file handles) held by this payload.
    ///
    /// Called exactly once, after `save` (successful or not).
    fn close(self: Box<Self>);
}

/// The ingress unit the [`Storer`](crate::storer::Storer) accepts: a payload plus its initial
/// retry budget and the wall-clock time it was enqueued.
pub struct DataRecord {
    pub data: Box<dyn Data>,
    pub ttl: i32,
    pub last_try: SystemTime,
}

impl DataRecord {
    /// Builds a new record with `ttl` and `last_try` set to "now".
    pub fn new(data: Box<dyn Data>, ttl: i32) -> Self {
        Self {
            data,
            ttl,
            last_try: SystemTime::now(),
        }
    }
}
