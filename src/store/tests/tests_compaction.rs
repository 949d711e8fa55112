#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    use crate::key::{ALL_VERSIONS, DELETE_MARKER, LATEST_TIMESTAMP, StoreKey};
    use crate::region::RegionConfig;
    use crate::schema::{ColumnDescriptor, RegionInfo, TableDescriptor};
    use crate::store::Store;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::DEBUG)
            .try_init();
    }

    fn key(row: &[u8], ts: u64) -> StoreKey {
        StoreKey::new(row.to_vec(), b"cf:a".to_vec(), ts)
    }

    fn open_store(dir: &std::path::Path, max_versions: u32) -> Store {
        let table = TableDescriptor::new(b"t".to_vec())
            .with_family(ColumnDescriptor::new(b"cf".to_vec()).with_max_versions(max_versions));
        let info = Arc::new(RegionInfo::with_region_id(table, Vec::new(), Vec::new(), 1));
        let family = info.table.family(b"cf").unwrap().clone();
        Store::open(dir, info, family, None, &RegionConfig::default()).unwrap()
    }

    fn flush(store: &Store, seq: u64) {
        store.snapshot_memcache().unwrap();
        store.flush_cache(seq).unwrap();
    }

    #[test]
    fn single_concrete_file_is_not_compacted() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), 3);

        store.add(key(b"r", 100), b"v".to_vec()).unwrap();
        flush(&store, 1);

        assert!(!store.needs_compaction());
        assert!(!store.compact().unwrap());
    }

    #[test]
    fn needs_compaction_at_file_threshold() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), 3);

        for seq in 1..=3 {
            store.add(key(b"r", seq * 100), b"v".to_vec()).unwrap();
            flush(&store, seq);
        }
        assert!(store.needs_compaction());
    }

    #[test]
    fn compaction_merges_files_and_preserves_reads() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), 3);

        store.add(key(b"a", 100), b"va".to_vec()).unwrap();
        flush(&store, 1);
        store.add(key(b"b", 100), b"vb".to_vec()).unwrap();
        flush(&store, 2);
        store.add(key(b"c", 100), b"vc".to_vec()).unwrap();
        flush(&store, 3);

        assert!(store.compact().unwrap());

        for (row, value) in [(b"a", b"va"), (b"b", b"vb"), (b"c", b"vc")] {
            let values = store.get(&key(row, LATEST_TIMESTAMP), 1).unwrap();
            assert_eq!(values, vec![value.to_vec()]);
        }

        // Everything is in one file now.
        let files = store.close().unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn compaction_caps_versions() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), 2);

        // Three versions, each in its own file.
        for (seq, value) in [
            (1u64, b"one".as_slice()),
            (2, b"two".as_slice()),
            (3, b"three".as_slice()),
        ] {
            store.add(key(b"r", seq * 100), value.to_vec()).unwrap();
            flush(&store, seq);
        }

        assert!(store.compact().unwrap());

        // Only the two newest versions remain.
        let values = store.get(&key(b"r", LATEST_TIMESTAMP), ALL_VERSIONS).unwrap();
        assert_eq!(values, vec![b"three".to_vec(), b"two".to_vec()]);
        let values = store.get(&key(b"r", 150), ALL_VERSIONS).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn compaction_drops_tombstones_and_their_victims() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), 3);

        store.add(key(b"r", 100), b"doomed".to_vec()).unwrap();
        store.add(key(b"keep", 100), b"kept".to_vec()).unwrap();
        flush(&store, 1);
        // Tombstone at the exact timestamp of the doomed cell, the way
        // region-level deletes write them.
        store.add(key(b"r", 100), DELETE_MARKER.to_vec()).unwrap();
        flush(&store, 2);

        assert!(store.compact().unwrap());

        let values = store.get(&key(b"r", LATEST_TIMESTAMP), ALL_VERSIONS).unwrap();
        assert!(values.is_empty());
        let values = store.get(&key(b"keep", LATEST_TIMESTAMP), 1).unwrap();
        assert_eq!(values, vec![b"kept".to_vec()]);

        // The compacted file holds no trace of the deleted cell: only
        // the surviving row remains.
        let files = store.close().unwrap();
        assert_eq!(files.len(), 1);
        let mut reader = files[0].reader().unwrap();
        let mut rows = Vec::new();
        while let Some((k, _)) = reader.next().unwrap() {
            rows.push(k.row);
        }
        assert_eq!(rows, vec![b"keep".to_vec()]);
    }

    #[test]
    fn size_reports_mid_key_for_splitable_store() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), 3);

        for row in [b"a", b"m", b"z"] {
            store.add(key(row, 100), b"v".to_vec()).unwrap();
        }
        flush(&store, 1);

        let size = store.size().unwrap();
        assert!(size.splitable);
        assert!(size.aggregate > 0);
        assert_eq!(size.mid_key, Some(b"m".to_vec()));
    }

    #[test]
    fn single_row_store_is_not_splitable() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), 3);

        for ts in [100, 200, 300] {
            store.add(key(b"only", ts), b"v".to_vec()).unwrap();
        }
        flush(&store, 1);

        let size = store.size().unwrap();
        assert!(!size.splitable);
        assert_eq!(size.mid_key, None);
    }
}
