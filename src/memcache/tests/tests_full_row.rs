#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::key::{DELETE_MARKER, LATEST_TIMESTAMP, StoreKey};
    use crate::memcache::Memcache;

    fn key(row: &[u8], col: &[u8], ts: u64) -> StoreKey {
        StoreKey::new(row.to_vec(), col.to_vec(), ts)
    }

    #[test]
    fn get_full_collects_newest_per_column() {
        let cache = Memcache::new();
        cache.add(key(b"r", b"cf:a", 100), b"a-old".to_vec()).unwrap();
        cache.add(key(b"r", b"cf:a", 200), b"a-new".to_vec()).unwrap();
        cache.add(key(b"r", b"cf:b", 100), b"b".to_vec()).unwrap();
        cache.add(key(b"s", b"cf:a", 100), b"other-row".to_vec()).unwrap();

        let mut deletes = BTreeMap::new();
        let mut results = BTreeMap::new();
        cache
            .get_full(
                &StoreKey::for_row_at(b"r".to_vec(), LATEST_TIMESTAMP),
                &mut deletes,
                &mut results,
            )
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[b"cf:a".as_slice()], b"a-new".to_vec());
        assert_eq!(results[b"cf:b".as_slice()], b"b".to_vec());
    }

    #[test]
    fn get_full_tombstone_occludes_older_cells() {
        let cache = Memcache::new();
        cache.add(key(b"r", b"cf:a", 100), b"old".to_vec()).unwrap();
        cache
            .add(key(b"r", b"cf:a", 200), DELETE_MARKER.to_vec())
            .unwrap();
        cache.add(key(b"r", b"cf:b", 100), b"b".to_vec()).unwrap();

        let mut deletes = BTreeMap::new();
        let mut results = BTreeMap::new();
        cache
            .get_full(
                &StoreKey::for_row_at(b"r".to_vec(), LATEST_TIMESTAMP),
                &mut deletes,
                &mut results,
            )
            .unwrap();

        assert!(!results.contains_key(b"cf:a".as_slice()));
        assert_eq!(results[b"cf:b".as_slice()], b"b".to_vec());
        assert_eq!(deletes[b"cf:a".as_slice()], 200);
    }

    #[test]
    fn get_full_value_newer_than_tombstone_survives() {
        let cache = Memcache::new();
        cache
            .add(key(b"r", b"cf:a", 100), DELETE_MARKER.to_vec())
            .unwrap();
        cache.add(key(b"r", b"cf:a", 200), b"alive".to_vec()).unwrap();

        let mut deletes = BTreeMap::new();
        let mut results = BTreeMap::new();
        cache
            .get_full(
                &StoreKey::for_row_at(b"r".to_vec(), LATEST_TIMESTAMP),
                &mut deletes,
                &mut results,
            )
            .unwrap();

        assert_eq!(results[b"cf:a".as_slice()], b"alive".to_vec());
    }

    #[test]
    fn row_key_at_or_before_basic() {
        let cache = Memcache::new();
        cache.add(key(b"b", b"cf:a", 100), b"v".to_vec()).unwrap();
        cache.add(key(b"d", b"cf:a", 100), b"v".to_vec()).unwrap();

        let mut candidates = BTreeMap::new();
        cache.row_key_at_or_before(b"c", &mut candidates).unwrap();
        let best = candidates.keys().next_back().unwrap();
        assert_eq!(best.row, b"b".to_vec());

        let mut candidates = BTreeMap::new();
        cache.row_key_at_or_before(b"d", &mut candidates).unwrap();
        let best = candidates.keys().next_back().unwrap();
        assert_eq!(best.row, b"d".to_vec());
    }

    #[test]
    fn row_key_at_or_before_obeys_tombstones() {
        let cache = Memcache::new();
        cache.add(key(b"b", b"cf:a", 100), b"v".to_vec()).unwrap();
        cache
            .add(key(b"b", b"cf:a", 200), DELETE_MARKER.to_vec())
            .unwrap();

        let mut candidates = BTreeMap::new();
        cache.row_key_at_or_before(b"c", &mut candidates).unwrap();
        assert!(candidates.is_empty());
    }
}
