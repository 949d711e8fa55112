#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::key::StoreKey;
    use crate::schema::BloomFilterSpec;
    use crate::storefile::bloom::StoreFilter;
    use crate::storefile::{StoreFile, StoreFileReader, StoreFileWriter};

    fn key(row: &[u8], col: &[u8], ts: u64) -> StoreKey {
        StoreKey::new(row.to_vec(), col.to_vec(), ts)
    }

    /// Writes a small file with three rows; cf:a has two versions on
    /// row b.
    fn write_sample(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("0000001");
        let mut writer = StoreFileWriter::create(&path).unwrap();
        writer.append(&key(b"a", b"cf:a", 100), b"a-100").unwrap();
        writer.append(&key(b"b", b"cf:a", 200), b"b-200").unwrap();
        writer.append(&key(b"b", b"cf:a", 100), b"b-100").unwrap();
        writer.append(&key(b"b", b"cf:b", 150), b"bb-150").unwrap();
        writer.append(&key(b"c", b"cf:a", 100), b"c-100").unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn sequential_read_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let path = write_sample(tmp.path());

        let mut reader = StoreFileReader::open(&path).unwrap();
        let mut keys = Vec::new();
        while let Some((k, _)) = reader.next().unwrap() {
            keys.push(k);
        }
        assert_eq!(keys.len(), 5);
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn writer_rejects_out_of_order_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        let mut writer = StoreFileWriter::create(&path).unwrap();
        writer.append(&key(b"b", b"cf:a", 100), b"x").unwrap();
        assert!(writer.append(&key(b"a", b"cf:a", 100), b"y").is_err());
        // Same row/column with a newer timestamp sorts earlier, so it
        // is out of order too.
        assert!(writer.append(&key(b"b", b"cf:a", 200), b"y").is_err());
    }

    #[test]
    fn get_closest_positions_the_cursor() {
        let tmp = TempDir::new().unwrap();
        let path = write_sample(tmp.path());
        let mut reader = StoreFileReader::open(&path).unwrap();

        // Smallest key at or after (b, cf:a, LATEST) is b/cf:a@200.
        let (found, value) = reader
            .get_closest(&StoreKey::for_row(b"b".to_vec()), false)
            .unwrap()
            .unwrap();
        assert_eq!(found.row, b"b".to_vec());
        assert_eq!(value, b"b-200".to_vec());

        // next() continues just past the returned cell.
        let (following, _) = reader.next().unwrap().unwrap();
        assert_eq!(following, key(b"b", b"cf:a", 100));
    }

    #[test]
    fn get_closest_at_or_before() {
        let tmp = TempDir::new().unwrap();
        let path = write_sample(tmp.path());
        let mut reader = StoreFileReader::open(&path).unwrap();

        // Nothing at or before a key smaller than the first cell.
        assert!(
            reader
                .get_closest(&StoreKey::for_row(b"A".to_vec()), true)
                .unwrap()
                .is_none()
        );

        // The largest key at or before row "bzz" is b/cf:b@150.
        let (found, _) = reader
            .get_closest(&StoreKey::for_row(b"bzz".to_vec()), true)
            .unwrap()
            .unwrap();
        assert_eq!(found, key(b"b", b"cf:b", 150));
    }

    #[test]
    fn final_and_mid_keys() {
        let tmp = TempDir::new().unwrap();
        let path = write_sample(tmp.path());
        let reader = StoreFileReader::open(&path).unwrap();

        assert_eq!(reader.final_key().unwrap().unwrap(), key(b"c", b"cf:a", 100));
        let mid = reader.mid_key().unwrap().unwrap();
        assert_eq!(mid.row, b"b".to_vec());
    }

    #[test]
    fn info_sidecar_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let file = StoreFile::new_unique(tmp.path(), "1234", b"cf", None).unwrap();
        file.write_info(42).unwrap();
        assert_eq!(file.load_info().unwrap(), 42);
    }

    #[test]
    fn file_name_parsing() {
        assert_eq!(StoreFile::parse_file_name("123"), Some((123, None)));
        assert_eq!(
            StoreFile::parse_file_name("123.987654"),
            Some((123, Some("987654".to_string())))
        );
        assert_eq!(StoreFile::parse_file_name("garbage"), None);
    }

    #[test]
    fn bloom_filter_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("filter");
        let spec = BloomFilterSpec::plain(100);

        let mut filter = StoreFilter::new(&spec).unwrap();
        filter.insert_row(b"present");
        filter.flush(&path).unwrap();

        let reloaded = StoreFilter::load_or_create(&path, &spec).unwrap();
        assert!(reloaded.maybe_contains(b"present"));
        assert!(!reloaded.maybe_contains(b"never-written"));
    }
}
