//! Error types for every concern the spool can fail at.
//!
//! Each enum corresponds to one of the error kinds this crate's error handling design distinguishes:
//! storage I/O failures, index corruption, and payload save/restore failures. Kept as separate
//! enums per module (rather than one crate-wide error) so that a caller matching on, say,
//! [`IndexError`] is not forced to also handle [`StorerError`] variants that can never occur at
//! that call site.

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Errors that can occur while creating, opening, or mutating an [`Index`](crate::index::Index).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IndexError {
    /// A general I/O error occurred while creating, opening, truncating, or mapping the index
    /// file.
    #[snafu(display("index I/O error at '{}': {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    /// The index file's header did not contain the expected magic number.
    ///
    /// This indicates the file is not an index file at all, or has been corrupted beyond the
    /// point of trust. The file is left in place for operator inspection.
    #[snafu(display(
        "corrupted index '{}': expected magic {:#010x}, found {:#010x}",
        path.display(),
        expected,
        found
    ))]
    BadMagic {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    /// The index file's header declared a version this build does not understand.
    #[snafu(display(
        "corrupted index '{}': expected version {}, found {}",
        path.display(),
        expected,
        found
    ))]
    BadVersion {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    /// The index file is smaller than a bare header, so it cannot possibly be valid.
    #[snafu(display(
        "corrupted index '{}': file is {} bytes, smaller than the {}-byte header",
        path.display(),
        found,
        expected
    ))]
    Truncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

impl IndexError {
    /// Returns `true` if this error represents a corrupted (as opposed to merely I/O-failed)
    /// index, as opposed to a file that merely failed to open or map.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            IndexError::BadMagic { .. } | IndexError::BadVersion { .. } | IndexError::Truncated { .. }
        )
    }
}

/// Errors that can occur while creating, opening, storing to, or restoring from a
/// [`Chunk`](crate::chunk::Chunk).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChunkError {
    /// The chunk's index could not be created, opened, or mutated.
    #[snafu(display("chunk index error: {}", source))]
    Index { source: IndexError },

    /// A general I/O error occurred against the chunk's data file.
    #[snafu(display("chunk data I/O error at '{}': {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    /// The external [`Data::save`](crate::codec::Data::save) implementation failed mid-write.
    ///
    /// Any bytes already written remain in the data file as dead space; no index
    /// slot is appended for this record, so it is simply invisible.
    #[snafu(display("payload save failed: {}", source))]
    PayloadSave { source: io::Error },

    /// A `restore` call asked for more bytes than remain in the data file.
    #[snafu(display(
        "short read restoring record at offset {}: expected {} bytes, got {}",
        offset,
        expected,
        found
    ))]
    PayloadRestore {
        offset: i64,
        expected: i64,
        found: usize,
    },
}

/// Errors that can occur while the [`Storer`](crate::storer::Storer) is running.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorerError {
    /// The storage directory could not be created or enumerated.
    #[snafu(display("cannot prepare storage directory '{}': {}", path.display(), source))]
    StorageDir { path: PathBuf, source: io::Error },

    /// A new chunk could not be created. This is fatal for the store loop: without a chunk to
    /// write to, the producer cannot make progress.
    #[snafu(display("cannot create new chunk: {}", source))]
    CreateChunk { source: ChunkError },

    /// The storage directory could not be enumerated for pre-existing finalized chunks at
    /// startup.
    #[snafu(display("cannot recover existing chunks: {}", source))]
    Recover { source: ChunkError },

    /// An existing chunk could not be finalized (renamed out of staging). This is fatal for the
    /// store loop for the same reason as `CreateChunk`.
    #[snafu(display("cannot finalize chunk: {}", source))]
    FinalizeChunk { source: ChunkError },

    /// The advisory lock on the storage directory is already held by another `Storer`.
    #[snafu(display(
        "storage directory '{}' is already in use by another spool process",
        path.display()
    ))]
    AlreadyLocked { path: PathBuf },
}
