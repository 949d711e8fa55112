#[cfg(test)]
mod tests {
    use crate::key::{
        DELETE_MARKER, LATEST_TIMESTAMP, StoreKey, family_of, is_deleted, qualifier_of,
    };

    #[test]
    fn rows_order_ascending() {
        let a = StoreKey::new(b"a".to_vec(), b"cf:x".to_vec(), 5);
        let b = StoreKey::new(b"b".to_vec(), b"cf:x".to_vec(), 5);
        assert!(a < b);
    }

    #[test]
    fn columns_order_ascending_within_row() {
        let a = StoreKey::new(b"r".to_vec(), b"cf:a".to_vec(), 5);
        let b = StoreKey::new(b"r".to_vec(), b"cf:b".to_vec(), 5);
        assert!(a < b);
    }

    #[test]
    fn timestamps_order_descending_within_column() {
        // The newer cell must sort first.
        let newer = StoreKey::new(b"r".to_vec(), b"cf:a".to_vec(), 200);
        let older = StoreKey::new(b"r".to_vec(), b"cf:a".to_vec(), 100);
        assert!(newer < older);
    }

    #[test]
    fn row_only_key_sorts_before_cells_of_the_row() {
        let seek = StoreKey::for_row(b"r".to_vec());
        let cell = StoreKey::new(b"r".to_vec(), b"cf:a".to_vec(), LATEST_TIMESTAMP);
        assert!(seek < cell);
    }

    #[test]
    fn column_split_on_first_colon() {
        assert_eq!(family_of(b"cf:qual"), b"cf");
        assert_eq!(qualifier_of(b"cf:qual"), b"qual");
        assert_eq!(family_of(b"cf:"), b"cf");
        assert_eq!(qualifier_of(b"cf:"), b"");
        assert_eq!(qualifier_of(b"cf:a:b"), b"a:b");
    }

    #[test]
    fn matches_without_column_honours_timestamp() {
        let query = StoreKey::for_row_at(b"r".to_vec(), 150);
        let older = StoreKey::new(b"r".to_vec(), b"cf:a".to_vec(), 100);
        let newer = StoreKey::new(b"r".to_vec(), b"cf:a".to_vec(), 200);
        assert!(query.matches_without_column(&older));
        assert!(!query.matches_without_column(&newer));
    }

    #[test]
    fn delete_marker_roundtrip() {
        assert!(is_deleted(DELETE_MARKER));
        assert!(!is_deleted(b"value"));
    }
}
