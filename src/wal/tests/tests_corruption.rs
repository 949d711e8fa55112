#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use crate::key::StoreKey;
    use crate::wal::{Wal, WalError};

    fn one_edit(row: &[u8]) -> BTreeMap<StoreKey, Vec<u8>> {
        let mut edits = BTreeMap::new();
        edits.insert(
            StoreKey::new(row.to_vec(), b"cf:a".to_vec(), 100),
            b"value".to_vec(),
        );
        edits
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wal.log");

        {
            let wal = Wal::open(&path, None).unwrap();
            wal.append_edits(b"region", b"table", &one_edit(b"r1")).unwrap();
        }

        // Corrupt one byte in the middle of the record body.
        let len = std::fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(len - 20)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        file.sync_all().unwrap();

        let wal = Wal::open(&path, None).unwrap();
        let result: Result<Vec<_>, _> = wal.replay_iter().unwrap().collect();
        assert!(matches!(result, Err(WalError::ChecksumMismatch)));
    }

    #[test]
    fn truncated_tail_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wal.log");

        {
            let wal = Wal::open(&path, None).unwrap();
            wal.append_edits(b"region", b"table", &one_edit(b"r1")).unwrap();
            wal.append_edits(b"region", b"table", &one_edit(b"r2")).unwrap();
        }

        // Chop ten bytes off the end, tearing the final record.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();
        file.sync_all().unwrap();

        let wal = Wal::open(&path, None).unwrap();
        let mut iter = wal.replay_iter().unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
    }

    #[test]
    fn bad_header_magic_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wal.log");

        {
            let _wal = Wal::open(&path, None).unwrap();
        }

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"XXXX").unwrap();
        file.sync_all().unwrap();

        assert!(matches!(
            Wal::open(&path, None),
            Err(WalError::InvalidHeader(_))
        ));
    }
}
