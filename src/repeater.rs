//! The consumer task: replays finalized chunks against an external delivery attempt.
//!
//! Grounded in the reference implementation's `repeater.go` (`repeateLoop`), restructured around
//! the index-driven `for_each_active` walk described in this crate's component design, rather than
//! the original's separate read/attempt/rewrite passes.

use std::{path::PathBuf, time::Duration};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::chunk::Chunk;

/// Delivers one record's restored bytes to the upstream forwarder.
///
/// Implemented by the external forwarder; the spool never constructs an `Attempt` itself, only
/// calls it once per active record inside [`Chunk::for_each_active`]. Returning `true` tells the
/// spool the record was delivered and its TTL should be driven to zero; `false` leaves it subject
/// to further retries, bounded by its remaining TTL and the back-off window.
pub trait Attempt: Send + Sync {
    /// Attempts delivery of `payload`, returning `true` if the upstream accepted it.
    async fn attempt(&self, payload: &[u8]) -> bool;
}

/// The consumer half of the spool: dequeues finalized chunk paths, replays their active records
/// against an [`Attempt`], and removes fully-drained chunks.
pub struct Repeater<A> {
    chunks: tokio::sync::mpsc::Receiver<PathBuf>,
    stop: tokio::sync::watch::Receiver<bool>,
    attempt: A,
    repeat_timeout: Duration,
}

impl<A: Attempt> Repeater<A> {
    /// Builds a repeater that pulls finalized chunk paths from `chunks`, retries their records
    /// against `attempt`, and watches `stop` for a shutdown signal.
    pub fn new(
        chunks: tokio::sync::mpsc::Receiver<PathBuf>,
        stop: tokio::sync::watch::Receiver<bool>,
        attempt: A,
        repeat_timeout: Duration,
    ) -> Self {
        Self {
            chunks,
            stop,
            attempt,
            repeat_timeout,
        }
    }

    /// Runs the repeat loop until the stop signal fires or the inbound channel closes.
    ///
    /// A chunk already being processed is always finished before the loop checks for shutdown
    /// again — there is no mid-chunk cancellation.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        debug!("stop signal received, shutting down repeater");
                        break;
                    }
                }

                maybe_path = self.chunks.recv() => {
                    match maybe_path {
                        Some(path) => self.process_chunk(path).await,
                        None => {
                            debug!("inbound chunk channel closed, shutting down repeater");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Opens `base_path` as a finalized chunk, replays its active records, and closes it —
    /// deleting the chunk's files if every record was delivered or aged out. Errors opening or
    /// processing the chunk are logged and the chunk is left on disk for operator inspection or a
    /// future run, matching this crate's non-fatal-on-the-consumer-side error policy.
    async fn process_chunk(&self, base_path: PathBuf) {
        let mut chunk = match Chunk::open(base_path.clone()) {
            Ok(chunk) => chunk,
            Err(source) => {
                error!(base = %base_path.display(), %source, "failed to open finalized chunk, skipping");
                return;
            }
        };

        let attempt = &self.attempt;
        let result = chunk
            .for_each_active(self.repeat_timeout, |_record, payload| async move {
                attempt.attempt(&payload).await
            })
            .await;

        if let Err(error) = result {
            error!(base = %base_path.display(), %error, "failed to process chunk, leaving it in place");
            return;
        }

        match chunk.close() {
            Ok(true) => debug!(base = %base_path.display(), "chunk fully drained and deleted"),
            Ok(false) => debug!(base = %base_path.display(), "chunk still has undelivered records"),
            Err(error) => warn!(base = %base_path.display(), %error, "failed to close drained chunk"),
        }
    }
}
