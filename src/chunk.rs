//! A chunk: one `.index` file paired with one `.data` file, forming a contiguous, durable batch
//! of persisted records.
//!
//! Grounded in the reference implementation's `storage/chunk.go` (`CreateChunk`, `OpenChunk`,
//! `Store`, `Restore`, `Finalize`, `ForEachActiveRecord`), reworked against this crate's own
//! back-off/TTL semantics.

use std::{
    fs::{File, OpenOptions},
    future::Future,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use snafu::ResultExt;
use tracing::{debug, trace, warn};

use crate::{
    codec::{system_time_to_nanos, DataRecord, IndexRecord},
    error::{self, ChunkError},
    index::Index,
};

const INDEX_SUFFIX: &str = ".index";
const DATA_SUFFIX: &str = ".data";
const TMP_SUFFIX: &str = ".tmp";

/// Appends `.index` to a chunk's base path.
pub fn index_path(base: &Path) -> PathBuf {
    append_suffix(base, INDEX_SUFFIX)
}

/// Appends `.data` to a chunk's base path.
pub fn data_path(base: &Path) -> PathBuf {
    append_suffix(base, DATA_SUFFIX)
}

/// Appends `.tmp` to an already-suffixed path, forming its staging name.
pub fn tmp_path(path: &Path) -> PathBuf {
    append_suffix(path, TMP_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(suffix);
    PathBuf::from(os_string)
}

/// One fixed batch of persisted records: an [`Index`] plus its matching data file.
pub struct Chunk {
    base_path: PathBuf,
    index: Index,
    data_file: File,
    /// `true` once `.index`/`.data` have been renamed out of `.tmp`; governs which paths
    /// `close`/`finalize` operate on.
    finalized: bool,
}

impl Chunk {
    /// Creates a brand-new chunk rooted at `storage_dir/{monotonic_ns}`, in staging form
    /// (`.index.tmp`/`.data.tmp`).
    pub fn create(storage_dir: &Path, now: SystemTime) -> Result<Self, ChunkError> {
        let nanos = system_time_to_nanos(now);
        let base_path = storage_dir.join(nanos.to_string());
        Self::create_at(base_path)
    }

    /// As [`Chunk::create`], but with an explicit base path. Exposed for tests that need
    /// deterministic or colliding chunk names.
    pub fn create_at(base_path: PathBuf) -> Result<Self, ChunkError> {
        let index_tmp = tmp_path(&index_path(&base_path));
        let data_tmp = tmp_path(&data_path(&base_path));

        let index = Index::create(&index_tmp).context(error::IndexSnafu)?;
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_tmp)
            .context(error::IoSnafu {
                path: data_tmp.clone(),
            })?;

        debug!(base = %base_path.display(), "created new staging chunk");

        Ok(Self {
            base_path,
            index,
            data_file,
            finalized: false,
        })
    }

    /// Opens a finalized chunk at `base_path` (`.index`/`.data`, no `.tmp` suffix), reopening its
    /// index read-write so retry state can be mutated in place.
    pub fn open(base_path: PathBuf) -> Result<Self, ChunkError> {
        let index_file_path = index_path(&base_path);
        let data_file_path = data_path(&base_path);

        let index = Index::open(&index_file_path).context(error::IndexSnafu)?;
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_file_path)
            .context(error::IoSnafu {
                path: data_file_path.clone(),
            })?;

        Ok(Self {
            base_path,
            index,
            data_file,
            finalized: true,
        })
    }

    /// This chunk's stable base path (without `.index`/`.data`/`.tmp` suffixes).
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Number of record slots whose `ttl > 0`.
    pub fn active_count(&self) -> i64 {
        self.index.active_count()
    }

    /// Total number of records ever appended to this chunk.
    pub fn length(&self) -> i64 {
        self.index.length()
    }

    /// A snapshot of every index slot in append order, for callers (tests, diagnostics) that need
    /// to inspect retry state without driving a full [`Chunk::for_each_active`] pass.
    pub fn index_records_snapshot(&self) -> Vec<IndexRecord> {
        self.index.records().to_vec()
    }

    /// Appends `record`'s payload to the data file and a matching slot to the index.
    ///
    /// If `Data::save` fails partway through, the partially-written bytes remain in the data file
    /// with no corresponding index slot — the record is simply invisible, matching the
    /// `PayloadSaveError` policy below. No index slot is appended in that case.
    pub fn store(&mut self, mut record: DataRecord) -> Result<(), ChunkError> {
        let offset = self
            .data_file
            .seek(SeekFrom::End(0))
            .context(error::IoSnafu {
                path: self.data_path(),
            })?;

        let save_result = record.data.save(&mut self.data_file);
        record.data.close();
        let written = save_result.context(error::PayloadSaveSnafu)?;

        let slot = self.index.append_record().context(error::IndexSnafu)?;
        slot.offset = offset as i64;
        slot.size = written as i64;
        slot.ttl = record.ttl;
        slot.last_try = system_time_to_nanos(record.last_try);

        trace!(
            base = %self.base_path.display(),
            offset,
            size = written,
            ttl = record.ttl,
            "stored record"
        );

        Ok(())
    }

    /// Reads back exactly `record.size` bytes starting at `record.offset`.
    pub fn restore(&mut self, record: &IndexRecord) -> Result<Vec<u8>, ChunkError> {
        self.data_file
            .seek(SeekFrom::Start(record.offset as u64))
            .context(error::IoSnafu {
                path: self.data_path(),
            })?;

        let mut buffer = vec![0u8; record.size as usize];
        let read = self
            .data_file
            .read(&mut buffer)
            .context(error::IoSnafu {
                path: self.data_path(),
            })?;

        if (read as i64) < record.size {
            // Try to fill the rest; a single `read` call is not guaranteed to fill the buffer
            // even when enough bytes remain.
            let mut total_read = read;
            while total_read < buffer.len() {
                let n = self
                    .data_file
                    .read(&mut buffer[total_read..])
                    .context(error::IoSnafu {
                        path: self.data_path(),
                    })?;
                if n == 0 {
                    return error::PayloadRestoreSnafu {
                        offset: record.offset,
                        expected: record.size,
                        found: total_read,
                    }
                    .fail();
                }
                total_read += n;
            }
        }

        Ok(buffer)
    }

    /// Flushes the index mapping and `fsync`s both files.
    pub fn flush(&self) -> Result<(), ChunkError> {
        self.index.flush().context(error::IndexSnafu)?;
        self.data_file.sync_all().context(error::IoSnafu {
            path: self.data_path(),
        })?;
        Ok(())
    }

    /// Closes both files. If `active_count() == 0`, deletes both on-disk files (whether still
    /// `.tmp` or already finalized).
    ///
    /// Returns `true` if the chunk was deleted (fully drained / never received any records).
    pub fn close(self) -> Result<bool, ChunkError> {
        let empty = self.active_count() == 0;
        let (index_path, data_path) = self.current_paths();
        // Dropping `self.index`/`self.data_file` here closes the underlying file descriptors and
        // unmaps the index.
        drop(self);

        if empty {
            remove_if_exists(&index_path)?;
            remove_if_exists(&data_path)?;
        }

        Ok(empty)
    }

    /// Closes this chunk and, unless it was empty (and therefore already deleted by `close`),
    /// atomically renames its files out of `.tmp` so it becomes visible to the consumer.
    ///
    /// Returns `true` if the chunk was deleted rather than finalized.
    pub fn finalize(self) -> Result<bool, ChunkError> {
        let base_path = self.base_path.clone();
        let was_finalized = self.finalized;
        let tmp_index = tmp_path(&index_path(&base_path));
        let tmp_data = tmp_path(&data_path(&base_path));
        let final_index = index_path(&base_path);
        let final_data = data_path(&base_path);

        let deleted = self.close()?;
        if deleted || was_finalized {
            return Ok(deleted);
        }

        std::fs::rename(&tmp_data, &final_data).context(error::IoSnafu {
            path: final_data.clone(),
        })?;
        std::fs::rename(&tmp_index, &final_index).context(error::IoSnafu {
            path: final_index.clone(),
        })?;

        debug!(base = %base_path.display(), "finalized chunk");

        Ok(false)
    }

    /// Iterates every active (`ttl > 0`, past its back-off window) record in append order,
    /// invoking `handler` for each and updating its TTL/`last_try` in place.
    ///
    /// `handler` is awaited in place, one record at a time, in append order — this is where the
    /// consumer's network-bound attempt function runs, with no concurrent fan-out across records in
    /// the same chunk. Per the `forEachActive` contract: records that
    /// are delivered (`handler` resolves to `true`) have their `ttl` driven to `0`; records that
    /// fail have `ttl` decremented by one. A record whose payload fails to restore (a short read
    /// against the data file) is treated the same as a failed delivery rather than aborting the
    /// rest of the pass. Either way, `last_try` is set to "now", and
    /// `active_count` is decremented whenever a record's `ttl` newly reaches zero. The index is
    /// flushed once at the end of the pass so the updated retry state survives a crash shortly
    /// afterward.
    pub async fn for_each_active<H, Fut>(
        &mut self,
        timeout: Duration,
        mut handler: H,
    ) -> Result<(), ChunkError>
    where
        H: FnMut(IndexRecord, Vec<u8>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let now = SystemTime::now();
        let now_nanos = system_time_to_nanos(now);
        let count = self.index.length() as usize;

        for i in 0..count {
            let record = self.index.records()[i];
            if record.ttl <= 0 {
                continue;
            }
            if now
                .duration_since(record.last_try_time())
                .unwrap_or_default()
                < timeout
            {
                continue;
            }

            // A restore failure (short read against a truncated/corrupted data file) is "not
            // delivered" for this one record, not fatal to the pass; otherwise every record after
            // it in the chunk would wedge behind it on every future pass.
            let delivered = match self.restore(&record) {
                Ok(payload) => handler(record, payload).await,
                Err(error) => {
                    warn!(
                        base = %self.base_path.display(),
                        index = i,
                        %error,
                        "failed to restore record payload, treating as not delivered"
                    );
                    false
                }
            };

            let newly_zero = {
                let slot = &mut self.index.records_mut()[i];
                if delivered {
                    slot.ttl = 0;
                } else {
                    slot.ttl -= 1;
                }
                slot.last_try = now_nanos;
                slot.ttl == 0
            };
            self.index
                .decrement_active_count_if_newly_zero(newly_zero);

            trace!(
                base = %self.base_path.display(),
                index = i,
                delivered,
                "advanced record retry state"
            );
        }

        self.index.flush().context(error::IndexSnafu)?;
        Ok(())
    }

    fn data_path(&self) -> PathBuf {
        if self.finalized {
            data_path(&self.base_path)
        } else {
            tmp_path(&data_path(&self.base_path))
        }
    }

    fn current_paths(&self) -> (PathBuf, PathBuf) {
        if self.finalized {
            (index_path(&self.base_path), data_path(&self.base_path))
        } else {
            (
                tmp_path(&index_path(&self.base_path)),
                tmp_path(&data_path(&self.base_path)),
            )
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), ChunkError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove drained chunk file");
            Err(ChunkError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    }
}

/// Enumerates finalized chunk base paths (files matching `*.index`, with no `.tmp` suffix) under
/// `storage_dir`, sorted so that older chunks (by their monotonic-nanosecond base name) sort
/// first.
pub fn discover_finalized_chunks(storage_dir: &Path) -> Result<Vec<PathBuf>, ChunkError> {
    let mut bases = Vec::new();
    let entries = std::fs::read_dir(storage_dir).context(error::IoSnafu {
        path: storage_dir.to_path_buf(),
    })?;

    for entry in entries {
        let entry = entry.context(error::IoSnafu {
            path: storage_dir.to_path_buf(),
        })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(base) = name.strip_suffix(INDEX_SUFFIX) {
            bases.push(storage_dir.join(base));
        }
    }

    bases.sort_by_key(|base| {
        base.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<i64>().ok())
            .unwrap_or(i64::MAX)
    });

    Ok(bases)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::codec::{Data, DataRecord};

    struct Bytes(Vec<u8>);

    impl Data for Bytes {
        fn save(&mut self, writer: &mut dyn Write) -> std::io::Result<usize> {
            writer.write_all(&self.0)?;
            Ok(self.0.len())
        }

        fn close(self: Box<Self>) {}
    }

    fn record(bytes: &[u8], ttl: i32) -> DataRecord {
        DataRecord::new(Box::new(Bytes(bytes.to_vec())), ttl)
    }

    #[test]
    fn store_then_restore_round_trips() {
        let dir = tempdir().unwrap();
        let mut chunk = Chunk::create_at(dir.path().join("base")).unwrap();

        chunk.store(record(b"test", 1)).unwrap();
        chunk.flush().unwrap();

        let restored = chunk.restore(&chunk_record(&mut chunk, 0)).unwrap();
        assert_eq!(restored, b"test");
    }

    fn chunk_record(chunk: &mut Chunk, index: usize) -> IndexRecord {
        chunk.index.records()[index]
    }

    #[test]
    fn finalize_empty_chunk_leaves_no_files() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let chunk = Chunk::create_at(base.clone()).unwrap();
        let deleted = chunk.finalize().unwrap();
        assert!(deleted);
        assert!(!index_path(&base).exists());
        assert!(!data_path(&base).exists());
        assert!(!tmp_path(&index_path(&base)).exists());
        assert!(!tmp_path(&data_path(&base)).exists());
    }

    #[test]
    fn finalize_nonempty_chunk_renames_into_place() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let mut chunk = Chunk::create_at(base.clone()).unwrap();
        chunk.store(record(b"qwerty", 2)).unwrap();
        let deleted = chunk.finalize().unwrap();
        assert!(!deleted);
        assert!(index_path(&base).exists());
        assert!(data_path(&base).exists());
        assert!(!tmp_path(&index_path(&base)).exists());
    }

    #[test]
    fn reopen_before_finalize_preserves_state() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        {
            let mut chunk = Chunk::create_at(base.clone()).unwrap();
            chunk.store(record(b"p", 5)).unwrap();
            chunk.flush().unwrap();
            // Simulate a crash: close without finalizing.
            chunk.close().unwrap();
        }

        // Staging files are still on disk (not renamed), so reopen them as a chunk directly.
        let index = Index::open(tmp_path(&index_path(&base))).unwrap();
        assert_eq!(index.length(), 1);
        assert_eq!(index.records()[0].ttl, 5);
    }

    #[tokio::test]
    async fn for_each_active_exhausts_ttl() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let mut chunk = Chunk::create_at(base).unwrap();
        chunk.store(record(b"qwerty", 2)).unwrap();

        chunk
            .for_each_active(Duration::ZERO, |_: IndexRecord, _: Vec<u8>| async { false })
            .await
            .unwrap();
        assert_eq!(chunk.active_count(), 1);
        assert_eq!(chunk.index.records()[0].ttl, 1);

        chunk
            .for_each_active(Duration::ZERO, |_: IndexRecord, _: Vec<u8>| async { false })
            .await
            .unwrap();
        assert_eq!(chunk.active_count(), 0);
        assert_eq!(chunk.index.records()[0].ttl, 0);
    }

    #[tokio::test]
    async fn for_each_active_respects_heterogeneous_ttls() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let mut chunk = Chunk::create_at(base).unwrap();
        chunk.store(record(b"a", 1)).unwrap();
        chunk.store(record(b"b", 2)).unwrap();
        chunk.store(record(b"c", 3)).unwrap();

        let mut calls = 0;
        chunk
            .for_each_active(Duration::ZERO, |_: IndexRecord, _: Vec<u8>| {
                calls += 1;
                let delivered = calls == 2; // deliver only the second record visited
                async move { delivered }
            })
            .await
            .unwrap();

        assert_eq!(chunk.index.records()[0].ttl, 0, "first record decremented to 0 and abandoned");
        assert_eq!(chunk.index.records()[1].ttl, 0, "second record delivered");
        assert_eq!(chunk.index.records()[2].ttl, 2, "third record decremented but still active");
        assert_eq!(chunk.active_count(), 1);
    }

    #[tokio::test]
    async fn for_each_active_honors_backoff_window() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let mut chunk = Chunk::create_at(base).unwrap();
        chunk.store(record(b"x", 3)).unwrap();

        let mut calls = 0;
        chunk
            .for_each_active(Duration::from_secs(3600), |_: IndexRecord, _: Vec<u8>| {
                calls += 1;
                async { false }
            })
            .await
            .unwrap();
        assert_eq!(calls, 0, "a fresh record must not be retried within the back-off window");
        assert_eq!(chunk.index.records()[0].ttl, 3);
    }

    #[tokio::test]
    async fn for_each_active_survives_a_short_read_on_one_record() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let mut chunk = Chunk::create_at(base).unwrap();
        chunk.store(record(b"first", 2)).unwrap();
        chunk.store(record(b"second", 2)).unwrap();
        chunk.flush().unwrap();

        // Simulate a crash-corrupted `.data` file by inflating the first record's recorded size
        // past what the data file actually holds, without disturbing the second record's
        // offset/size. `restore` will then short-read for the first record only.
        chunk.index.records_mut()[0].size += 100;

        let mut calls = Vec::new();
        chunk
            .for_each_active(Duration::ZERO, |record, payload| {
                calls.push(record.offset);
                async move {
                    let _ = payload;
                    true
                }
            })
            .await
            .unwrap();

        // The handler must still run for the second record even though the first failed to
        // restore, and the pass must flush rather than bail out early.
        assert_eq!(calls, vec![5], "only the restorable record reaches the handler");
        assert_eq!(
            chunk.index.records()[0].ttl, 1,
            "the short-read record is treated as not-delivered, not skipped entirely"
        );
        assert_eq!(
            chunk.index.records()[1].ttl, 0,
            "the second record must still be processed and delivered"
        );
        assert_eq!(chunk.active_count(), 1);
    }

    #[test]
    fn discover_finalized_chunks_sorts_by_name() {
        let dir = tempdir().unwrap();
        for name in ["300", "100", "200"] {
            std::fs::write(dir.path().join(format!("{name}.index")), []).unwrap();
            std::fs::write(dir.path().join(format!("{name}.data")), []).unwrap();
        }
        std::fs::write(dir.path().join("400.index.tmp"), []).unwrap();

        let found = discover_finalized_chunks(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["100", "200", "300"]);
    }
}
