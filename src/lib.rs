//! A durable, chunked, TTL-bounded disk spool.
//!
//! This crate is the retry backbone of a reliable HTTP forwarding proxy: when an upstream attempt
//! fails, the proxy hands the request to a [`Storer`], which durably appends it to an
//! append-only on-disk [`Chunk`][chunk::Chunk]. A [`Repeater`] independently walks finalized
//! chunks and re-attempts delivery, bounded by a per-record time-to-live counter and a back-off
//! window, until the record is delivered or its TTL is exhausted.
//!
//! The subsystem is deliberately narrow: it knows nothing about HTTP, upstream selection, or
//! argument parsing. It consumes two traits from its caller ([`Data`][codec::Data] for
//! serializing a payload, [`Attempt`][repeater::Attempt] for delivering one) and exposes chunk
//! identifiers and restored record bytes in return.
//!
//! ```text
//! Data --(bounded channel)--> Storer --(chunk rotation)--> finalized chunk path
//!                                                                 |
//!                                                       (bounded channel)
//!                                                                 v
//!                                                             Repeater --(Attempt)--> upstream
//! ```
//!
//! [`SpoolHandle::open`] wires the two tasks together over channels sized by
//! [`SpoolConfig::buffer_size`] for callers that don't need to manage the channels themselves.

pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod repeater;
pub mod spool;
pub mod storer;

pub use chunk::Chunk;
pub use codec::{Data, DataRecord, IndexHeader, IndexRecord};
pub use config::{SpoolConfig, SpoolConfigBuilder};
pub use error::{ChunkError, IndexError, StorerError};
pub use repeater::{Attempt, Repeater};
pub use spool::SpoolHandle;
pub use storer::Storer;
