//! Write-Ahead Log for the primary index
//!
//! Every mutation of the primary index (and of the trigger table, which
//! cannot be rebuilt from the heaps) is appended and fsynced here before it
//! becomes visible in memory. The log fsync is the commit point: on
//! recovery, replaying the log over the last snapshot reconstructs every
//! committed operation.
//!
//! Format per entry:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode-serialized LogRecord)
//! - crc: u32 (4 bytes, CRC32 of length + data)

use crate::storage::error::{DbError, DbResult};
use crate::storage::triggers::{Operation, TriggerSpec};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Upper bound on a single entry; anything larger is treated as corruption.
const MAX_ENTRY_SIZE: usize = 1_000_000;

/// A logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    /// Bind `pk` to heap offsets (insert, or offset change on rewrite).
    Put {
        pk: String,
        ts_offset: u64,
        meta_offset: u64,
    },
    /// Remove `pk` from the primary index.
    Del { pk: String },
    /// Append a trigger.
    TriggerAdd { on: Operation, spec: TriggerSpec },
    /// Remove the first trigger matching (operation, proc).
    TriggerDel { on: Operation, proc: String },
}

/// One log entry: a sequence number and the operation it commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: u64,
    pub op: LogOp,
}

/// Append-only, CRC-framed log file.
pub struct WriteAheadLog {
    file: File,
    path: PathBuf,
}

impl WriteAheadLog {
    /// Open or create the log file.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        Ok(Self { file, path })
    }

    /// Append a record and fsync it. Returns only after the entry is
    /// durable; this is the commit point for the enclosing operation.
    pub fn append(&mut self, record: &LogRecord) -> DbResult<()> {
        let data = bincode::serialize(record)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(data.len() as u32).to_le_bytes());
        hasher.update(&data);
        let crc = hasher.finalize();

        self.file.write_all(&(data.len() as u32).to_le_bytes())?;
        self.file.write_all(&data)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every intact record for recovery. A torn or corrupt tail stops
    /// the replay with a warning and is truncated so it cannot shadow later
    /// appends.
    pub fn replay(&mut self) -> DbResult<Vec<LogRecord>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_bytes = 0u64;

        loop {
            match Self::read_entry_from(&mut reader) {
                Ok(Some((record, entry_len))) => {
                    valid_bytes += entry_len;
                    records.push(record);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        "log replay stopped after {} records: {}",
                        records.len(),
                        e
                    );
                    self.file.set_len(valid_bytes)?;
                    break;
                }
            }
        }

        Ok(records)
    }

    /// Read a single entry; `Ok(None)` at a clean EOF.
    fn read_entry_from<R: Read>(reader: &mut R) -> DbResult<Option<(LogRecord, u64)>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(DbError::Corruption(format!(
                "log entry length too large: {}",
                len
            )));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&data);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(DbError::Corruption(format!(
                "log entry CRC mismatch: stored={}, computed={}",
                stored_crc, computed_crc
            )));
        }

        let record: LogRecord = bincode::deserialize(&data)?;
        Ok(Some((record, 8 + len as u64)))
    }

    /// Drop all entries; called after a successful snapshot.
    pub fn truncate(&mut self) -> DbResult<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use std::io::SeekFrom;
    use tempfile::tempdir;

    fn put(lsn: u64, pk: &str) -> LogRecord {
        LogRecord {
            lsn,
            op: LogOp::Put {
                pk: pk.to_string(),
                ts_offset: 8 + lsn * 160,
                meta_offset: lsn * 10,
            },
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pk.log");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.append(&put(1, "ts-0")).unwrap();
            wal.append(&put(2, "ts-1")).unwrap();
            wal.append(&LogRecord {
                lsn: 3,
                op: LogOp::Del {
                    pk: "ts-0".to_string(),
                },
            })
            .unwrap();
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let records = wal.replay().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], put(1, "ts-0"));
        assert_eq!(records[2].lsn, 3);
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path().join("pk.log")).unwrap();

        for i in 0..10 {
            wal.append(&put(i, &format!("ts-{}", i))).unwrap();
        }
        wal.truncate().unwrap();

        assert!(wal.replay().unwrap().is_empty());

        // the log accepts appends after truncation
        wal.append(&put(11, "ts-11")).unwrap();
        assert_eq!(wal.replay().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pk.log");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.append(&put(1, "ts-0")).unwrap();
            wal.append(&put(2, "ts-1")).unwrap();
        }

        // corrupt the second entry
        let first_entry_len = {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            let _ = wal.replay().unwrap();
            let data = bincode::serialize(&put(1, "ts-0")).unwrap();
            8 + data.len() as u64
        };
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(first_entry_len + 6)).unwrap();
            file.write_all(&[0xFF, 0xFF]).unwrap();
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let records = wal.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], put(1, "ts-0"));

        // the corrupt tail was truncated away
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            first_entry_len
        );
    }

    #[test]
    fn test_trigger_records_roundtrip() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path().join("pk.log")).unwrap();

        let spec = TriggerSpec {
            proc: "stats".to_string(),
            targets: vec!["mean".to_string(), "std".to_string()],
            arg: None,
        };
        wal.append(&LogRecord {
            lsn: 1,
            op: LogOp::TriggerAdd {
                on: Operation::InsertTs,
                spec: spec.clone(),
            },
        })
        .unwrap();
        wal.append(&LogRecord {
            lsn: 2,
            op: LogOp::TriggerDel {
                on: Operation::InsertTs,
                proc: "stats".to_string(),
            },
        })
        .unwrap();

        let records = wal.replay().unwrap();
        assert_eq!(records.len(), 2);
        match &records[0].op {
            LogOp::TriggerAdd { on, spec: s } => {
                assert_eq!(*on, Operation::InsertTs);
                assert_eq!(*s, spec);
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }
}
