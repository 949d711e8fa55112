#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::key::StoreKey;
    use crate::storefile::{Half, Reference, StoreFile, StoreFileReader, StoreFileWriter};

    fn key(row: &[u8], ts: u64) -> StoreKey {
        StoreKey::new(row.to_vec(), b"cf:a".to_vec(), ts)
    }

    /// Parent file with rows a, m, z under table-dir layout.
    fn write_parent(basedir: &std::path::Path) -> StoreFile {
        let parent = StoreFile::new_unique(basedir, "parent", b"cf", None).unwrap();
        let mut writer = StoreFileWriter::create(&parent.map_path()).unwrap();
        writer.append(&key(b"a", 100), b"va").unwrap();
        writer.append(&key(b"m", 100), b"vm").unwrap();
        writer.append(&key(b"z", 100), b"vz").unwrap();
        writer.finish().unwrap();
        parent.write_info(7).unwrap();
        parent
    }

    #[test]
    fn halves_partition_the_parent() {
        let tmp = TempDir::new().unwrap();
        let parent = write_parent(tmp.path());

        let bottom = Reference {
            parent_region: "parent".to_string(),
            file_id: parent.id(),
            split_key: b"m".to_vec(),
            half: Half::Bottom,
        };
        let top = Reference {
            split_key: b"m".to_vec(),
            half: Half::Top,
            ..bottom.clone()
        };

        let mut reader = StoreFileReader::open_reference(&parent.map_path(), &bottom).unwrap();
        let mut rows = Vec::new();
        while let Some((k, _)) = reader.next().unwrap() {
            rows.push(k.row);
        }
        assert_eq!(rows, vec![b"a".to_vec()]);

        let mut reader = StoreFileReader::open_reference(&parent.map_path(), &top).unwrap();
        let mut rows = Vec::new();
        while let Some((k, _)) = reader.next().unwrap() {
            rows.push(k.row);
        }
        assert_eq!(rows, vec![b"m".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn reference_bounds_apply_to_point_lookups() {
        let tmp = TempDir::new().unwrap();
        let parent = write_parent(tmp.path());

        let bottom = Reference {
            parent_region: "parent".to_string(),
            file_id: parent.id(),
            split_key: b"m".to_vec(),
            half: Half::Bottom,
        };
        let mut reader = StoreFileReader::open_reference(&parent.map_path(), &bottom).unwrap();

        // Row m lives in the top half; the bottom reader must not see it.
        assert!(
            reader
                .get_closest(&StoreKey::for_row(b"m".to_vec()), false)
                .unwrap()
                .is_none()
        );
        assert_eq!(reader.final_key().unwrap().unwrap().row, b"a".to_vec());
    }

    #[test]
    fn reference_file_roundtrip_through_reader() {
        let tmp = TempDir::new().unwrap();
        let parent = write_parent(tmp.path());

        let reference = Reference {
            parent_region: "parent".to_string(),
            file_id: parent.id(),
            split_key: b"m".to_vec(),
            half: Half::Top,
        };
        let child = StoreFile::new_unique(tmp.path(), "child", b"cf", Some(reference)).unwrap();
        child.write_reference(parent.load_info().unwrap()).unwrap();

        // Identity encodes the parent region in the file name.
        let name = child.map_path().file_name().unwrap().to_str().unwrap().to_string();
        let (_, parent_region) = StoreFile::parse_file_name(&name).unwrap();
        assert_eq!(parent_region.as_deref(), Some("parent"));

        // The sidecar carries the parent's sequence id.
        assert_eq!(child.load_info().unwrap(), 7);

        // Reading back the projection and opening a reader through it
        // serves only the top half.
        let read_back = StoreFile::read_reference(&child.map_path()).unwrap();
        assert_eq!(read_back.half, Half::Top);
        let mut reader = child.reader().unwrap();
        let (first, _) = reader.next().unwrap().unwrap();
        assert_eq!(first.row, b"m".to_vec());
    }
}
