//! Checksummed snapshot files
//!
//! All index snapshots (`pk.idx`, `index_<field>.idx`, `triggers.idx`,
//! `isax.idx`) share one framing: bincode payload followed by a CRC32
//! trailer, written to a temporary file and renamed into place. A missing
//! file is reported distinctly from a corrupt one so callers can decide
//! between first-run initialization and a rebuild.

use crate::storage::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Serialize `value` and write it atomically to `path`.
pub fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> DbResult<()> {
    let payload = bincode::serialize(value)?;
    let crc = crc32fast::hash(&payload);

    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a snapshot written by [`write_snapshot`]. Returns `Ok(None)` if the
/// file does not exist and `Corruption` if the checksum or payload is bad.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> DbResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 {
        return Err(DbError::Corruption(format!(
            "snapshot {:?} is too short to carry a checksum",
            path
        )));
    }

    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(DbError::Corruption(format!(
            "snapshot {:?} checksum mismatch: stored={}, computed={}",
            path, stored, computed
        )));
    }

    let value = bincode::deserialize(payload)?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u64);
        map.insert("b".to_string(), 2u64);

        write_snapshot(&path, &map).unwrap();
        let restored: BTreeMap<String, u64> = read_snapshot(&path).unwrap().unwrap();
        assert_eq!(restored, map);
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempdir().unwrap();
        let result: Option<Vec<u32>> =
            read_snapshot(&dir.path().join("absent.idx")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");

        write_snapshot(&path, &vec![1u64, 2, 3]).unwrap();

        // flip a payload byte
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = read_snapshot::<Vec<u64>>(&path).unwrap_err();
        assert_eq!(err.kind(), "Integrity");
    }
}
