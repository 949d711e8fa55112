#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    use crate::key::{DELETE_MARKER, StoreKey};
    use crate::wal::{LogRecord, Wal};

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn one_edit(row: &[u8], value: &[u8]) -> BTreeMap<StoreKey, Vec<u8>> {
        let mut edits = BTreeMap::new();
        edits.insert(
            StoreKey::new(row.to_vec(), b"cf:a".to_vec(), 100),
            value.to_vec(),
        );
        edits
    }

    #[test]
    fn sequences_are_monotonic_across_record_types() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(tmp.path().join("wal.log"), None).unwrap();

        let s1 = wal.append_edits(b"region", b"table", &one_edit(b"r1", b"x")).unwrap();
        let s2 = wal.start_cache_flush(b"region", b"table").unwrap();
        let s3 = wal.append_edits(b"region", b"table", &one_edit(b"r2", b"y")).unwrap();

        assert!(s1 < s2 && s2 < s3);
    }

    #[test]
    fn replay_yields_records_in_append_order() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(tmp.path().join("wal.log"), None).unwrap();

        let s1 = wal.append_edits(b"region", b"table", &one_edit(b"r1", b"x")).unwrap();
        let s2 = wal.start_cache_flush(b"region", b"table").unwrap();
        wal.complete_cache_flush(b"region", b"table", s2).unwrap();

        let records: Vec<_> = wal
            .replay_iter()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(records.len(), 3);
        match &records[0] {
            LogRecord::Edits { sequence, edits, .. } => {
                assert_eq!(*sequence, s1);
                assert_eq!(edits.len(), 1);
                assert_eq!(edits[0].row, b"r1");
                assert_eq!(edits[0].value, b"x");
            }
            other => panic!("unexpected record: {:?}", other),
        }
        assert!(matches!(records[1], LogRecord::CacheFlushStart { sequence, .. } if sequence == s2));
        assert!(matches!(
            records[2],
            LogRecord::CacheFlushComplete { sequence, .. } if sequence == s2
        ));
    }

    #[test]
    fn batch_shares_one_sequence_id() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(tmp.path().join("wal.log"), None).unwrap();

        let mut edits = BTreeMap::new();
        edits.insert(StoreKey::new(b"r".to_vec(), b"cf:a".to_vec(), 1), b"1".to_vec());
        edits.insert(StoreKey::new(b"r".to_vec(), b"cf:b".to_vec(), 1), b"2".to_vec());
        edits.insert(
            StoreKey::new(b"r".to_vec(), b"cf:c".to_vec(), 1),
            DELETE_MARKER.to_vec(),
        );
        let seq = wal.append_edits(b"region", b"table", &edits).unwrap();

        let records: Vec<_> = wal
            .replay_iter()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        match &records[0] {
            LogRecord::Edits { sequence, edits, .. } => {
                assert_eq!(*sequence, seq);
                assert_eq!(edits.len(), 3);
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn reopen_resumes_sequence_counter() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wal.log");

        let first = {
            let wal = Wal::open(&path, None).unwrap();
            wal.append_edits(b"region", b"table", &one_edit(b"r1", b"x")).unwrap()
        };

        let wal = Wal::open(&path, None).unwrap();
        let next = wal.append_edits(b"region", b"table", &one_edit(b"r2", b"y")).unwrap();
        assert!(next > first);
    }

    #[test]
    fn advance_sequence_raises_the_floor() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(tmp.path().join("wal.log"), None).unwrap();

        wal.advance_sequence(500);
        let seq = wal.append_edits(b"region", b"table", &one_edit(b"r", b"v")).unwrap();
        assert!(seq > 500);

        // A lower floor must not move the counter backwards.
        wal.advance_sequence(10);
        let seq2 = wal.append_edits(b"region", b"table", &one_edit(b"r", b"v")).unwrap();
        assert!(seq2 > seq);
    }
}
