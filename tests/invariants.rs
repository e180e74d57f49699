//! Property tests for the invariants a chunk must hold regardless of what gets stored in it.

use std::{io, time::Duration};

use proptest::prelude::*;
use spool::{
    chunk::Chunk,
    codec::{Data, DataRecord},
};
use tempfile::tempdir;

struct Bytes(Vec<u8>);

impl Data for Bytes {
    fn save(&mut self, writer: &mut dyn io::Write) -> io::Result<usize> {
        writer.write_all(&self.0)?;
        Ok(self.0.len())
    }

    fn close(self: Box<Self>) {}
}

fn record(bytes: Vec<u8>, ttl: i32) -> DataRecord {
    DataRecord::new(Box::new(Bytes(bytes)), ttl)
}

proptest! {
    /// Storing an arbitrary sequence of payloads and restoring each by its recorded index slot
    /// must return exactly the bytes that were stored, regardless of payload size or count.
    #[test]
    fn store_then_restore_round_trips_for_any_payload_sequence(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..256), 1..32)
    ) {
        let dir = tempdir().unwrap();
        let mut chunk = Chunk::create_at(dir.path().join("base")).unwrap();

        for payload in &payloads {
            chunk.store(record(payload.clone(), 3)).unwrap();
        }
        chunk.flush().unwrap();

        let snapshot: Vec<_> = chunk.index_records_snapshot();
        prop_assert_eq!(snapshot.len(), payloads.len());

        for (i, expected) in payloads.iter().enumerate() {
            let restored = chunk.restore(&snapshot[i]).unwrap();
            prop_assert_eq!(&restored, expected);
        }
    }

    /// Offsets must be strictly non-decreasing and non-overlapping in append order, and
    /// `active_count` must always equal the number of records whose `ttl > 0`.
    #[test]
    fn offsets_are_non_overlapping_and_active_count_matches(
        sizes in proptest::collection::vec(1usize..128, 1..32)
    ) {
        let dir = tempdir().unwrap();
        let mut chunk = Chunk::create_at(dir.path().join("base")).unwrap();

        for size in &sizes {
            chunk.store(record(vec![0xABu8; *size], 1)).unwrap();
        }

        let records = chunk.index_records_snapshot();
        for pair in records.windows(2) {
            prop_assert!(pair[0].offset + pair[0].size <= pair[1].offset);
        }

        let active = records.iter().filter(|r| r.ttl > 0).count() as i64;
        prop_assert_eq!(chunk.active_count(), active);
        prop_assert_eq!(chunk.active_count(), sizes.len() as i64);
    }

    /// After exactly `k` unsuccessful passes on a record whose initial TTL is `k`, the record's
    /// `ttl` must be exactly `0` and `active_count` must have been decremented by exactly one
    /// (not once per pass).
    #[test]
    fn ttl_reaches_exactly_zero_after_initial_ttl_failed_passes(initial_ttl in 1i32..8) {
        let dir = tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut chunk = Chunk::create_at(dir.path().join("base")).unwrap();
            chunk.store(record(b"x".to_vec(), initial_ttl)).unwrap();

            for pass in 0..initial_ttl {
                chunk
                    .for_each_active(Duration::ZERO, |_r, _b| async { false })
                    .await
                    .unwrap();
                let remaining = initial_ttl - (pass + 1);
                assert_eq!(chunk.index_records_snapshot()[0].ttl, remaining.max(0));
            }

            assert_eq!(chunk.index_records_snapshot()[0].ttl, 0);
            assert_eq!(chunk.active_count(), 0);
        });
    }
}
