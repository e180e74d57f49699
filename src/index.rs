//! The memory-mapped, fixed-stride record index backing a single [`Chunk`](crate::chunk::Chunk).
//!
//! # Warning
//!
//! The index file is memory-mapped directly onto [`IndexHeader`]/[`IndexRecord`]. Appending a
//! record truncates (grows) the underlying file and re-establishes the mapping — any reference
//! returned by a previous [`Index::append_record`] call is invalidated at that point. This is
//! enforced by Rust: `append_record` takes `&mut self` and returns a reference borrowed from
//! `self`, so the borrow checker will not let two such references coexist.

use std::{
    fs::{File, OpenOptions},
    mem,
    path::{Path, PathBuf},
    slice,
};

use memmap2::MmapMut;
use snafu::{ensure, ResultExt};
use tracing::trace;

use crate::{
    codec::{IndexHeader, IndexRecord, INDEX_MAGIC, INDEX_VERSION},
    error::{self, IndexError},
};

const HEADER_LEN: usize = mem::size_of::<IndexHeader>();
const RECORD_LEN: usize = mem::size_of::<IndexRecord>();

/// A memory-mapped array of [`IndexRecord`]s, preceded by an [`IndexHeader`].
pub struct Index {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl Index {
    /// Creates a brand-new index file at `path`, truncated to a bare header and initialized with
    /// a fresh [`IndexHeader`].
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .context(error::IoSnafu { path: path.clone() })?;
        file.set_len(HEADER_LEN as u64)
            .context(error::IoSnafu { path: path.clone() })?;

        let mut map = unsafe { MmapMut::map_mut(&file) }
            .context(error::IoSnafu { path: path.clone() })?;

        // SAFETY: `map` is exactly `HEADER_LEN` bytes, matching the layout of `IndexHeader`, and
        // `IndexHeader` is `#[repr(C)]` with no padding-sensitive invariants other than its field
        // layout.
        let header = unsafe { &mut *(map.as_mut_ptr() as *mut IndexHeader) };
        *header = IndexHeader::new();

        trace!(path = %path.display(), "created new index");

        Ok(Self { path, file, map })
    }

    /// Opens an existing, finalized index file at `path`, validating its header.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Truncated`] if the file is smaller than a bare header,
    /// [`IndexError::BadMagic`]/[`IndexError::BadVersion`] if the header does not match what this
    /// build expects. In all three cases the file is left untouched on disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .context(error::IoSnafu { path: path.clone() })?;

        let len = file
            .metadata()
            .context(error::IoSnafu { path: path.clone() })?
            .len() as usize;
        ensure!(
            len >= HEADER_LEN,
            error::TruncatedSnafu {
                path: path.clone(),
                expected: HEADER_LEN,
                found: len,
            }
        );

        let map = unsafe { MmapMut::map_mut(&file) }
            .context(error::IoSnafu { path: path.clone() })?;

        let header = unsafe { &*(map.as_ptr() as *const IndexHeader) };
        ensure!(
            header.magic == INDEX_MAGIC,
            error::BadMagicSnafu {
                path: path.clone(),
                expected: INDEX_MAGIC,
                found: header.magic,
            }
        );
        ensure!(
            header.version == INDEX_VERSION,
            error::BadVersionSnafu {
                path: path.clone(),
                expected: INDEX_VERSION,
                found: header.version,
            }
        );

        trace!(path = %path.display(), length = header.length, active_count = header.active_count, "opened existing index");

        Ok(Self { path, file, map })
    }

    /// Path of this index's backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> &IndexHeader {
        // SAFETY: every constructor validates the mapping is at least `HEADER_LEN` bytes before
        // returning, and the mapping is never shrunk.
        unsafe { &*(self.map.as_ptr() as *const IndexHeader) }
    }

    fn header_mut(&mut self) -> &mut IndexHeader {
        unsafe { &mut *(self.map.as_mut_ptr() as *mut IndexHeader) }
    }

    /// Total number of record slots ever appended to this index.
    pub fn length(&self) -> i64 {
        self.header().length
    }

    /// Number of record slots whose `ttl > 0`.
    pub fn active_count(&self) -> i64 {
        self.header().active_count
    }

    /// Returns the current records as a slice, in append order.
    pub fn records(&self) -> &[IndexRecord] {
        let len = self.header().length as usize;
        if len == 0 {
            return &[];
        }
        // SAFETY: the mapping holds `HEADER_LEN + length * RECORD_LEN` bytes (an invariant
        // maintained by `append_record`), and `IndexRecord` is `#[repr(C)]`.
        unsafe {
            let base = self.map.as_ptr().add(HEADER_LEN) as *const IndexRecord;
            slice::from_raw_parts(base, len)
        }
    }

    /// Returns the current records as a mutable slice, in append order.
    pub fn records_mut(&mut self) -> &mut [IndexRecord] {
        let len = self.header().length as usize;
        if len == 0 {
            return &mut [];
        }
        unsafe {
            let base = self.map.as_mut_ptr().add(HEADER_LEN) as *mut IndexRecord;
            slice::from_raw_parts_mut(base, len)
        }
    }

    /// Appends a new, zeroed record slot, growing the backing file by one stride and
    /// re-establishing the mapping. Returns a mutable reference to the new slot for the caller to
    /// populate.
    ///
    /// Increments both `length` and `active_count` — callers are expected to populate a record
    /// with `ttl > 0`; a caller storing an already-dead record should decrement `active_count`
    /// itself afterwards, though nothing in this crate currently does so.
    pub fn append_record(&mut self) -> Result<&mut IndexRecord, IndexError> {
        let current_len = self.file.metadata().context(error::IoSnafu {
            path: self.path.clone(),
        })?.len();
        let new_len = current_len + RECORD_LEN as u64;
        self.file
            .set_len(new_len)
            .context(error::IoSnafu { path: self.path.clone() })?;

        // Growing the file invalidates the existing mapping's bounds; re-map over the new size.
        self.map = unsafe { MmapMut::map_mut(&self.file) }
            .context(error::IoSnafu { path: self.path.clone() })?;

        let header = self.header_mut();
        header.length += 1;
        header.active_count += 1;
        let index = (header.length - 1) as usize;

        trace!(path = %self.path.display(), index, "appended index record");

        Ok(&mut self.records_mut()[index])
    }

    /// Marks the record at `index` as delivered or abandoned (`ttl` reaching exactly `0`),
    /// decrementing `active_count` by one. Does nothing if the record's `ttl` is already `0`.
    pub(crate) fn decrement_active_count_if_newly_zero(&mut self, ttl_is_newly_zero: bool) {
        if ttl_is_newly_zero {
            self.header_mut().active_count -= 1;
        }
    }

    /// Flushes the memory-mapped file to disk.
    pub fn flush(&self) -> Result<(), IndexError> {
        self.map.flush().context(error::IoSnafu {
            path: self.path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn create_initializes_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.index");
        let index = Index::create(&path).unwrap();
        assert_eq!(index.length(), 0);
        assert_eq!(index.active_count(), 0);
    }

    #[test]
    fn append_record_grows_and_updates_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.index");
        let mut index = Index::create(&path).unwrap();

        {
            let record = index.append_record().unwrap();
            record.ttl = 3;
            record.last_try = 0;
            record.offset = 0;
            record.size = 4;
        }
        assert_eq!(index.length(), 1);
        assert_eq!(index.active_count(), 1);
        assert_eq!(index.records()[0].size, 4);

        {
            let record = index.append_record().unwrap();
            record.ttl = 1;
            record.last_try = 0;
            record.offset = 4;
            record.size = 6;
        }
        assert_eq!(index.length(), 2);
        assert_eq!(index.active_count(), 2);
        // The first record's slot must not have been disturbed by the second append.
        assert_eq!(index.records()[0].size, 4);
        assert_eq!(index.records()[1].size, 6);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.index");
        std::fs::write(&path, vec![0u8; HEADER_LEN]).unwrap();
        let err = Index::open(&path).unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(err, IndexError::BadMagic { .. }));
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.index");
        std::fs::write(&path, vec![0u8; 4]).unwrap();
        let err = Index::open(&path).unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(err, IndexError::Truncated { .. }));
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.index");
        {
            let mut index = Index::create(&path).unwrap();
            let record = index.append_record().unwrap();
            record.ttl = 5;
            record.last_try = 1234;
            record.offset = 0;
            record.size = 10;
            index.flush().unwrap();
        }

        let index = Index::open(&path).unwrap();
        assert_eq!(index.length(), 1);
        assert_eq!(index.active_count(), 1);
        assert_eq!(index.records()[0].ttl, 5);
        assert_eq!(index.records()[0].last_try, 1234);
    }
}
