#[cfg(test)]
mod tests {
    use crate::scanner::{
        ColumnMatchSet, ColumnMatcher, RowFilter, RowPrefixFilter, ScannerError, StopRowFilter,
    };

    #[test]
    fn family_only_matches_any_qualifier() {
        let matcher = ColumnMatcher::new(b"cf:").unwrap();
        assert!(matcher.is_wildcard());
        assert!(matcher.matches(b"cf:anything"));
        assert!(matcher.matches(b"cf:"));
        assert!(!matcher.matches(b"other:anything"));
    }

    #[test]
    fn literal_matches_exactly() {
        let matcher = ColumnMatcher::new(b"cf:name").unwrap();
        assert!(!matcher.is_wildcard());
        assert!(matcher.matches(b"cf:name"));
        assert!(!matcher.matches(b"cf:names"));
        assert!(!matcher.matches(b"cf:nam"));
    }

    #[test]
    fn regex_qualifier_matches_pattern() {
        let matcher = ColumnMatcher::new(b"cf:val.*").unwrap();
        assert!(matcher.is_wildcard());
        assert!(matcher.matches(b"cf:value"));
        assert!(matcher.matches(b"cf:val"));
        assert!(!matcher.matches(b"cf:other"));
        // Anchored: a superstring of the pattern must not pass.
        assert!(!matcher.matches(b"xcf:value"));
    }

    #[test]
    fn malformed_regex_is_rejected() {
        let result = ColumnMatcher::new(b"cf:val[");
        assert!(matches!(result, Err(ScannerError::InvalidColumn { .. })));
    }

    #[test]
    fn match_set_flags() {
        let set = ColumnMatchSet::new(&[b"cf:exact".to_vec()]).unwrap();
        assert!(!set.is_wildcard());
        assert!(!set.is_multiple());

        let set = ColumnMatchSet::new(&[b"cf:".to_vec()]).unwrap();
        assert!(set.is_wildcard());
        assert!(!set.is_multiple());

        let set = ColumnMatchSet::new(&[b"cf:a".to_vec(), b"cf:b".to_vec()]).unwrap();
        assert!(!set.is_wildcard());
        assert!(set.is_multiple());
        assert!(set.matches(b"cf:a"));
        assert!(set.matches(b"cf:b"));
        assert!(!set.matches(b"cf:c"));
    }

    #[test]
    fn prefix_filter_discards_other_rows() {
        let mut filter = RowPrefixFilter::new(b"user-".to_vec());
        assert!(!filter.filter_row_key(b"user-42"));
        assert!(filter.filter_row_key(b"order-1"));
        assert!(!filter.filter_all_remaining());
    }

    #[test]
    fn stop_row_filter_terminates() {
        let mut filter = StopRowFilter::new(b"m".to_vec());
        assert!(!filter.filter_row_key(b"a"));
        assert!(!filter.filter_all_remaining());
        assert!(filter.filter_row_key(b"m"));
        assert!(filter.filter_all_remaining());

        filter.reset();
        assert!(!filter.filter_all_remaining());
    }
}
