//! Wiring: builds the channel pair this crate's concurrency model calls for and spawns a
//! [`Storer`]/[`Repeater`] pair over it as Tokio tasks.
//!
//! Grounded in `variant/disk_v2.rs`'s `into_buffer_parts` (builds the channel, spawns the writer
//! task, hands the caller a sender) — the same shape, generalized to this crate's two tasks
//! instead of one.

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    codec::{Data, DataRecord},
    config::SpoolConfig,
    error::StorerError,
    repeater::{Attempt, Repeater},
    storer::Storer,
};

/// A running `Storer`/`Repeater` pair, wired together over channels sized by
/// [`SpoolConfig::buffer_size`].
///
/// Dropping the `data` sender (or calling [`SpoolHandle::shutdown`]) lets the `Storer` drain and
/// exit; the `Repeater` is stopped independently via its own stop signal so that in-flight
/// delivery attempts are never cancelled mid-chunk.
pub struct SpoolHandle {
    /// Submits new records to the `Storer`. Drop this (or call [`SpoolHandle::shutdown`]) to begin
    /// graceful shutdown. Prefer [`SpoolHandle::submit`], which stamps each payload with the
    /// configured initial TTL; this field remains available for callers that need to hand-construct
    /// a `DataRecord` with a non-default TTL.
    pub data: mpsc::Sender<DataRecord>,
    repeat_number: i32,
    stop: watch::Sender<bool>,
    storer_task: JoinHandle<Result<(), StorerError>>,
    repeater_task: JoinHandle<()>,
}

impl SpoolHandle {
    /// Builds the `data`/`chunks` channels from `config.buffer_size`, constructs a `Storer` (which
    /// performs startup recovery synchronously, acquiring `buffer.lock`) and a `Repeater` bound to
    /// `attempt`, and spawns both as independent Tokio tasks.
    pub async fn open<A>(config: SpoolConfig, attempt: A) -> Result<Self, StorerError>
    where
        A: Attempt + 'static,
    {
        let (data_tx, data_rx) = mpsc::channel(config.buffer_size);
        let (chunk_tx, chunk_rx) = mpsc::channel(config.buffer_size);
        let (stop_tx, stop_rx) = watch::channel(false);

        let repeat_number = config.repeat_number;
        let repeat_timeout = config.repeat_timeout;
        let storer = Storer::new(config, data_rx, chunk_tx).await?;
        let repeater = Repeater::new(chunk_rx, stop_rx, attempt, repeat_timeout);

        let storer_task = tokio::spawn(storer.run());
        let repeater_task = tokio::spawn(repeater.run());

        Ok(Self {
            data: data_tx,
            repeat_number,
            stop: stop_tx,
            storer_task,
            repeater_task,
        })
    }

    /// Submits `payload` for durable storage, with its initial TTL set to the configured
    /// `repeat_number`.
    pub async fn submit(&self, payload: Box<dyn Data>) -> Result<(), mpsc::error::SendError<()>> {
        let record = DataRecord::new(payload, self.repeat_number);
        self.data
            .send(record)
            .await
            .map_err(|_| mpsc::error::SendError(()))
    }

    /// Begins graceful shutdown: drops the inbound sender (letting the `Storer` drain and exit)
    /// and signals the `Repeater` to stop after it finishes any chunk already in flight, then waits
    /// for both tasks to exit.
    ///
    /// # Panics
    ///
    /// Panics if either spawned task itself panicked, mirroring `JoinHandle::await`'s own
    /// behavior — this crate does not swallow task panics.
    pub async fn shutdown(self) -> Result<(), StorerError> {
        drop(self.data);
        let _ = self.stop.send(true);

        let storer_result = self.storer_task.await.expect("storer task panicked");
        self.repeater_task.await.expect("repeater task panicked");

        storer_result
    }
}
