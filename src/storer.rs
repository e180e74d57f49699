//! The producer task: durably persists inbound records into rotating chunks.
//!
//! Grounded in the reference implementation's `storage/storer.go` (`storeLoop`), restructured
//! around `tokio::select!` the way `disk_v2`'s writer task multiplexes its own channels and a
//! rotation timer.

use std::{collections::VecDeque, path::PathBuf};

use fslock::LockFile;
use snafu::{ensure, ResultExt};
use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    chunk::{discover_finalized_chunks, Chunk},
    codec::DataRecord,
    config::SpoolConfig,
    error::{self, StorerError},
};

const LOCK_FILE_NAME: &str = "buffer.lock";

/// The producer half of the spool: durably appends inbound records and rotates chunks on a timer.
///
/// Owns the currently-active staging [`Chunk`] and a FIFO backlog of finalized chunk paths
/// awaiting publication to the [`Repeater`](crate::repeater::Repeater). Holds `buffer.lock` for
/// its entire lifetime so a second `Storer` cannot be started against the same storage directory.
pub struct Storer {
    config: SpoolConfig,
    inbound: mpsc::Receiver<DataRecord>,
    outbound: mpsc::Sender<PathBuf>,
    current_chunk: Option<Chunk>,
    finalized_backlog: VecDeque<PathBuf>,
    _lock: LockFile,
}

impl Storer {
    /// Prepares the storage directory (creating it if necessary), acquires `buffer.lock`,
    /// recovers any pre-existing finalized chunks into the initial backlog, and creates a fresh
    /// staging chunk to receive new records.
    pub async fn new(
        config: SpoolConfig,
        inbound: mpsc::Receiver<DataRecord>,
        outbound: mpsc::Sender<PathBuf>,
    ) -> Result<Self, StorerError> {
        std::fs::create_dir_all(&config.storage_dir).context(error::StorageDirSnafu {
            path: config.storage_dir.clone(),
        })?;

        let lock_path = config.storage_dir.join(LOCK_FILE_NAME);
        let mut lock = LockFile::open(&lock_path).context(error::StorageDirSnafu {
            path: lock_path.clone(),
        })?;
        let acquired = lock.try_lock().context(error::StorageDirSnafu {
            path: lock_path.clone(),
        })?;
        ensure!(
            acquired,
            error::AlreadyLockedSnafu {
                path: config.storage_dir.clone(),
            }
        );

        let finalized_backlog: VecDeque<PathBuf> =
            discover_finalized_chunks(&config.storage_dir)
                .context(error::RecoverSnafu)?
                .into_iter()
                .collect();

        info!(
            storage_dir = %config.storage_dir.display(),
            recovered = finalized_backlog.len(),
            "storer starting up"
        );

        let current_chunk = Chunk::create(&config.storage_dir, std::time::SystemTime::now())
            .context(error::CreateChunkSnafu)?;

        Ok(Self {
            config,
            inbound,
            outbound,
            current_chunk: Some(current_chunk),
            finalized_backlog,
            _lock: lock,
        })
    }

    /// Runs the store loop until the inbound channel is closed, finalizing the current chunk
    /// (and emitting its path downstream, if non-empty) before returning.
    ///
    /// Fatal I/O errors against the current chunk (create/finalize) abort the loop; failures
    /// saving an individual record are logged and the loop continues with the next inbound
    /// record.
    pub async fn run(mut self) -> Result<(), StorerError> {
        let mut rotate = time::interval(self.config.chunk_lifetime);
        rotate.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so chunks live a full `chunk_lifetime`.
        rotate.tick().await;

        loop {
            let can_publish = !self.finalized_backlog.is_empty();

            tokio::select! {
                biased;

                maybe_record = self.inbound.recv() => {
                    match maybe_record {
                        Some(record) => self.handle_inbound(record),
                        None => {
                            debug!("inbound channel closed, shutting down storer");
                            break;
                        }
                    }
                }

                _ = rotate.tick() => {
                    self.rotate_current_chunk().await?;
                }

                permit = self.outbound.reserve(), if can_publish => {
                    if let Ok(permit) = permit {
                        if let Some(path) = self.finalized_backlog.pop_front() {
                            permit.send(path);
                        }
                    } else {
                        // The repeater side has been dropped; nothing to publish to any more.
                        warn!("outbound chunk channel closed while backlog non-empty");
                    }
                }
            }
        }

        self.finalize_current_chunk().await?;
        Ok(())
    }

    fn handle_inbound(&mut self, record: DataRecord) {
        let chunk = self
            .current_chunk
            .as_mut()
            .expect("current_chunk is always Some between loop iterations");

        if let Err(error) = chunk.store(record) {
            error!(%error, "failed to store record, dropping it");
        } else {
            trace!("stored inbound record");
        }
    }

    /// Finalizes the current chunk if it received any records, pushes its path to the backlog,
    /// and replaces it with a fresh staging chunk. Empty chunks are simply discarded (they
    /// self-delete on close) rather than finalized.
    async fn rotate_current_chunk(&mut self) -> Result<(), StorerError> {
        let chunk = self
            .current_chunk
            .take()
            .expect("current_chunk is always Some between loop iterations");

        if chunk.active_count() > 0 {
            let base_path = chunk.base_path().to_path_buf();
            chunk.finalize().context(error::FinalizeChunkSnafu)?;
            debug!(base = %base_path.display(), "rotated chunk on timer");
            self.finalized_backlog.push_back(base_path);
        } else {
            trace!("rotation tick found an empty chunk, skipping finalize");
            chunk.close().context(error::FinalizeChunkSnafu)?;
        }

        self.current_chunk = Some(
            Chunk::create(&self.config.storage_dir, std::time::SystemTime::now())
                .context(error::CreateChunkSnafu)?,
        );
        Ok(())
    }

    /// Finalizes the current chunk at shutdown and emits its path if it received any records.
    async fn finalize_current_chunk(&mut self) -> Result<(), StorerError> {
        let chunk = self
            .current_chunk
            .take()
            .expect("current_chunk is always Some until shutdown");

        if chunk.active_count() > 0 {
            let base_path = chunk.base_path().to_path_buf();
            chunk.finalize().context(error::FinalizeChunkSnafu)?;
            // Best-effort: if the repeater side is already gone, the path is simply left on disk
            // to be recovered by the next run.
            let _ = self.outbound.send(base_path).await;
        } else {
            chunk.close().context(error::FinalizeChunkSnafu)?;
        }

        Ok(())
    }
}
