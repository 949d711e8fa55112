#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    use crate::key::LATEST_TIMESTAMP;
    use crate::region::{BatchUpdate, Region, RegionConfig, RegionError};
    use crate::schema::{
        ColumnDescriptor, OLD_LOG_FILE_NAME, RegionInfo, TableDescriptor, region_dir, table_dir,
    };
    use crate::wal::Wal;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::DEBUG)
            .try_init();
    }

    fn table() -> TableDescriptor {
        TableDescriptor::new(b"t".to_vec()).with_family(ColumnDescriptor::new(b"cf".to_vec()))
    }

    fn small_file_config() -> RegionConfig {
        RegionConfig {
            // Tiny split threshold so a handful of rows is enough.
            desired_max_file_size: 1,
            ..RegionConfig::default()
        }
    }

    fn put(region: &Region, ts: u64, row: &[u8], column: &[u8], value: &[u8]) {
        let mut batch = BatchUpdate::new(row.to_vec());
        batch.put(column.to_vec(), value.to_vec());
        region.batch_update(ts, &batch).unwrap();
    }

    #[test]
    fn flush_then_read_through() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let info = RegionInfo::new(table(), Vec::new(), Vec::new());
        let region = Region::create(tmp.path(), info, RegionConfig::default()).unwrap();

        for i in 0..5u8 {
            put(&region, 100, &[b'r', b'0' + i], b"cf:a", &[b'v', b'0' + i]);
        }

        assert!(region.flushcache().unwrap());
        // Nothing left unflushed: a second flush is a no-op.
        assert!(!region.flushcache().unwrap());

        // Reads come back identical from the new store file.
        for i in 0..5u8 {
            let values = region
                .get(&[b'r', b'0' + i], b"cf:a", LATEST_TIMESTAMP, 1)
                .unwrap();
            assert_eq!(values, vec![vec![b'v', b'0' + i]]);
        }
    }

    #[test]
    fn tombstone_survives_flush_and_compaction() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let info = RegionInfo::new(table(), Vec::new(), Vec::new());
        let region = Region::create(tmp.path(), info, RegionConfig::default()).unwrap();

        put(&region, 100, b"r", b"cf:a", b"x");
        region.flushcache().unwrap();
        region.delete_all(b"r", Some(b"cf:a".as_slice()), 200).unwrap();
        put(&region, 100, b"keep", b"cf:a", b"y");
        region.flushcache().unwrap();

        assert!(region.get(b"r", b"cf:a", LATEST_TIMESTAMP, 1).unwrap().is_empty());

        assert!(region.compact_stores().unwrap());

        assert!(region.get(b"r", b"cf:a", LATEST_TIMESTAMP, 1).unwrap().is_empty());
        let values = region.get(b"keep", b"cf:a", LATEST_TIMESTAMP, 1).unwrap();
        assert_eq!(values, vec![b"y".to_vec()]);
    }

    #[test]
    fn closed_region_rejects_operations() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let info = RegionInfo::new(table(), Vec::new(), Vec::new());
        let region = Region::create(tmp.path(), info, RegionConfig::default()).unwrap();

        put(&region, 100, b"r", b"cf:a", b"x");
        let files = region.close(false, None).unwrap().unwrap();
        // The final flush produced one file for the family.
        assert_eq!(files.len(), 1);

        assert!(matches!(
            region.get(b"r", b"cf:a", LATEST_TIMESTAMP, 1),
            Err(RegionError::RegionClosed(_))
        ));
        assert!(matches!(
            region.obtain_row_lock(b"r"),
            Err(RegionError::RegionClosed(_))
        ));

        // Closing again is a no-op.
        assert!(region.close(false, None).unwrap().is_none());
    }

    #[test]
    fn split_partitions_rows_between_children() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let info = RegionInfo::new(table(), Vec::new(), Vec::new());
        let region = Region::create(tmp.path(), info, small_file_config()).unwrap();
        let wal = Arc::clone(region.wal());
        let tabledir = table_dir(tmp.path(), b"t");

        for row in [b"a", b"m", b"z"] {
            put(&region, 100, row, b"cf:a", b"v");
        }
        region.flushcache().unwrap();

        assert_eq!(region.needs_split().unwrap(), Some(b"m".to_vec()));

        let (info_a, info_b) = region.split_region(None).unwrap().unwrap();
        assert!(region.is_closed());
        assert_eq!(info_a.end_key, b"m".to_vec());
        assert_eq!(info_b.start_key, b"m".to_vec());

        // Child A serves exactly the rows below the mid key, through
        // reference files at first.
        let child_a = Region::open(
            &tabledir,
            Arc::clone(&wal),
            info_a,
            small_file_config(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            child_a.get(b"a", b"cf:a", LATEST_TIMESTAMP, 1).unwrap(),
            vec![b"v".to_vec()]
        );
        assert!(matches!(
            child_a.get(b"m", b"cf:a", LATEST_TIMESTAMP, 1),
            Err(RegionError::OutOfRangeRow { .. })
        ));

        let child_b = Region::open(
            &tabledir,
            Arc::clone(&wal),
            info_b,
            small_file_config(),
            None,
            None,
        )
        .unwrap();
        for row in [b"m", b"z"] {
            assert_eq!(
                child_b.get(row, b"cf:a", LATEST_TIMESTAMP, 1).unwrap(),
                vec![b"v".to_vec()]
            );
        }

        // Children start on references, so neither is splitable and
        // both want compaction.
        assert!(child_a.needs_split().unwrap().is_none());
        assert!(child_a.compact_if_needed().unwrap());
        assert!(child_b.compact_if_needed().unwrap());

        // Compaction materialised independent files; the parent region
        // directory can now be retired.
        let parent_dir = region_dir(&tabledir, region.info().encoded_name());
        fs::remove_dir_all(&parent_dir).unwrap();

        assert_eq!(
            child_a.get(b"a", b"cf:a", LATEST_TIMESTAMP, 1).unwrap(),
            vec![b"v".to_vec()]
        );
        assert_eq!(
            child_b.get(b"z", b"cf:a", LATEST_TIMESTAMP, 1).unwrap(),
            vec![b"v".to_vec()]
        );

        // Scanning each child yields exactly its rows.
        let mut scanner = child_b
            .get_scanner(&[b"cf:".to_vec()], b"", LATEST_TIMESTAMP, None)
            .unwrap();
        let mut rows = Vec::new();
        while let Some((key, _)) = scanner.next().unwrap() {
            rows.push(key.row.clone());
        }
        assert_eq!(rows, vec![b"m".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn merge_adjacent_regions() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let info_a = RegionInfo::new(table(), Vec::new(), b"m".to_vec());
        let region_a = Region::create(tmp.path(), info_a, RegionConfig::default()).unwrap();
        put(&region_a, 100, b"a", b"cf:a", b"va");

        let tabledir = table_dir(tmp.path(), b"t");
        let info_b = RegionInfo::new(table(), b"m".to_vec(), Vec::new());
        let region_b = Region::open(
            &tabledir,
            Arc::clone(region_a.wal()),
            info_b,
            RegionConfig::default(),
            None,
            None,
        )
        .unwrap();
        put(&region_b, 100, b"x", b"cf:a", b"vx");

        let merged = Region::merge_adjacent(region_a, region_b).unwrap();
        assert_eq!(merged.start_key(), b"");
        assert_eq!(merged.end_key(), b"");

        for (row, value) in [(b"a", b"va"), (b"x", b"vx")] {
            assert_eq!(
                merged.get(row, b"cf:a", LATEST_TIMESTAMP, 1).unwrap(),
                vec![value.to_vec()]
            );
        }
    }

    #[test]
    fn merge_rejects_different_tables() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let region_a = Region::create(
            tmp.path(),
            RegionInfo::new(table(), Vec::new(), b"m".to_vec()),
            RegionConfig::default(),
        )
        .unwrap();

        let other = TableDescriptor::new(b"other".to_vec())
            .with_family(ColumnDescriptor::new(b"cf".to_vec()));
        let region_b = Region::create(
            tmp.path(),
            RegionInfo::new(other, b"m".to_vec(), Vec::new()),
            RegionConfig::default(),
        )
        .unwrap();

        assert!(matches!(
            Region::merge(region_a, region_b),
            Err(RegionError::MergePrecondition(_))
        ));
    }

    #[test]
    fn reconstruction_log_replay_restores_unflushed_edits() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let info = RegionInfo::new(table(), Vec::new(), Vec::new());
        let encoded = info.encoded_name().to_string();

        // Write without flushing, then "crash" (drop without close).
        {
            let region = Region::create(tmp.path(), info.clone(), RegionConfig::default()).unwrap();
            put(&region, 100, b"r", b"cf:a", b"recovered");
        }

        // The external log splitter hands the region its share of the
        // WAL as oldlogfile.log.
        let tabledir = table_dir(tmp.path(), b"t");
        let regiondir = region_dir(&tabledir, &encoded);
        fs::rename(
            regiondir.join("log").join("wal.log"),
            regiondir.join(OLD_LOG_FILE_NAME),
        )
        .unwrap();

        let wal = Arc::new(Wal::open(regiondir.join("log").join("wal.log"), None).unwrap());
        let region = Region::open(
            &tabledir,
            wal,
            info,
            RegionConfig::default(),
            None,
            None,
        )
        .unwrap();

        // The replayed edit is served from the reconstruction flush,
        // and the log share is gone.
        let values = region.get(b"r", b"cf:a", LATEST_TIMESTAMP, 1).unwrap();
        assert_eq!(values, vec![b"recovered".to_vec()]);
        assert!(!regiondir.join(OLD_LOG_FILE_NAME).exists());

        // New sequence ids continue above the replayed ones.
        assert!(region.min_sequence_id() > 0);
    }

    #[test]
    fn flush_complete_records_make_replay_skip_flushed_edits() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let info = RegionInfo::new(table(), Vec::new(), Vec::new());
        let encoded = info.encoded_name().to_string();

        {
            let region = Region::create(tmp.path(), info.clone(), RegionConfig::default()).unwrap();
            put(&region, 100, b"flushed", b"cf:a", b"on-disk");
            region.flushcache().unwrap();
            put(&region, 100, b"pending", b"cf:a", b"in-log-only");
        }

        let tabledir = table_dir(tmp.path(), b"t");
        let regiondir = region_dir(&tabledir, &encoded);
        fs::rename(
            regiondir.join("log").join("wal.log"),
            regiondir.join(OLD_LOG_FILE_NAME),
        )
        .unwrap();

        let wal = Arc::new(Wal::open(regiondir.join("log").join("wal.log"), None).unwrap());
        let region = Region::open(
            &tabledir,
            wal,
            info,
            RegionConfig::default(),
            None,
            None,
        )
        .unwrap();

        // Both the flushed and the replayed edits are visible exactly
        // once.
        assert_eq!(
            region.get(b"flushed", b"cf:a", LATEST_TIMESTAMP, 5).unwrap(),
            vec![b"on-disk".to_vec()]
        );
        assert_eq!(
            region.get(b"pending", b"cf:a", LATEST_TIMESTAMP, 5).unwrap(),
            vec![b"in-log-only".to_vec()]
        );
    }
}
