//! Heap files for raw series and metadata
//!
//! Both heaps are fixed-record binary files addressed by byte offset; the
//! primary index holds the offsets and is the only way records are reached.
//!
//! `heap_ts.met` layout:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER: series length L (u64, little-endian) │
//! ├──────────────────────────────────────────────┤
//! │ RECORDS: 16·L bytes each                     │
//! │   L times (f64 LE), then L values (f64 LE)   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! `heap_meta.met` has no header: its record layout lives in the schema,
//! which is persisted separately. A torn trailing record (crash mid-append)
//! is truncated on open; the primary index never references it because the
//! WAL record for the insert was not yet written.

use crate::storage::error::{DbError, DbResult};
use crate::storage::series::TimeSeries;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the TsHeap header.
const TS_HEADER_SIZE: u64 = 8;

/// Append-only store for raw series records.
#[derive(Debug)]
pub struct TsHeap {
    file: File,
    path: PathBuf,
    ts_length: usize,
    write_offset: u64,
}

impl TsHeap {
    /// Open or create the heap, verifying the series length against the
    /// header. A trailing partial record is truncated.
    pub fn open(path: impl AsRef<Path>, ts_length: usize) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let stride = (16 * ts_length) as u64;
        let write_offset = if exists {
            let mut header = [0u8; TS_HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header).map_err(|_| {
                DbError::Corruption(format!("series heap {:?} is missing its header", path))
            })?;
            let stored = u64::from_le_bytes(header);
            if stored != ts_length as u64 {
                return Err(DbError::SchemaMismatch(format!(
                    "series heap holds series of length {}, database expects {}",
                    stored, ts_length
                )));
            }

            let len = file.metadata()?.len();
            let body = len - TS_HEADER_SIZE;
            let tail = body % stride;
            if tail != 0 {
                tracing::warn!(
                    "truncating {} torn bytes at the end of {:?}",
                    tail,
                    path
                );
                file.set_len(len - tail)?;
                len - tail
            } else {
                len
            }
        } else {
            file.write_all(&(ts_length as u64).to_le_bytes())?;
            file.sync_all()?;
            TS_HEADER_SIZE
        };

        Ok(Self {
            file,
            path,
            ts_length,
            write_offset,
        })
    }

    /// Byte stride of one record.
    pub fn stride(&self) -> u64 {
        (16 * self.ts_length) as u64
    }

    /// Number of records in the heap.
    pub fn record_count(&self) -> u64 {
        (self.write_offset - TS_HEADER_SIZE) / self.stride()
    }

    /// Append a series and return the byte offset of its record.
    pub fn write(&mut self, ts: &TimeSeries) -> DbResult<u64> {
        if ts.len() != self.ts_length {
            return Err(DbError::InvalidArgument(format!(
                "series length {} does not match database length {}",
                ts.len(),
                self.ts_length
            )));
        }

        let offset = self.write_offset;
        let mut buf = Vec::with_capacity(self.stride() as usize);
        for t in ts.times() {
            buf.extend_from_slice(&t.to_le_bytes());
        }
        for v in ts.values() {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        self.write_offset += self.stride();
        Ok(offset)
    }

    /// Read the series record at `offset`.
    pub fn read(&mut self, offset: u64) -> DbResult<TimeSeries> {
        self.check_offset(offset)?;

        let mut buf = vec![0u8; self.stride() as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;

        let mut times = Vec::with_capacity(self.ts_length);
        let mut values = Vec::with_capacity(self.ts_length);
        for i in 0..self.ts_length {
            let pos = i * 8;
            times.push(f64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap()));
        }
        for i in 0..self.ts_length {
            let pos = (self.ts_length + i) * 8;
            values.push(f64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap()));
        }

        TimeSeries::new(times, values)
            .map_err(|e| DbError::Corruption(format!("series record at {}: {}", offset, e)))
    }

    /// Flush buffered writes to stable storage.
    pub fn sync(&mut self) -> DbResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `offset` addresses a whole record.
    pub fn contains_offset(&self, offset: u64) -> bool {
        self.check_offset(offset).is_ok()
    }

    fn check_offset(&self, offset: u64) -> DbResult<()> {
        let aligned = offset >= TS_HEADER_SIZE && (offset - TS_HEADER_SIZE) % self.stride() == 0;
        if !aligned || offset + self.stride() > self.write_offset {
            return Err(DbError::Corruption(format!(
                "offset {} does not address a series record",
                offset
            )));
        }
        Ok(())
    }
}

/// Fixed-record store for encoded metadata tuples.
///
/// Headerless; the record size comes from the schema. Supports in-place
/// overwrite because metadata is mutable while raw series are not.
pub struct MetaHeap {
    file: File,
    path: PathBuf,
    record_size: usize,
    write_offset: u64,
}

impl MetaHeap {
    /// Open or create the heap for records of `record_size` bytes. A torn
    /// trailing record is truncated.
    pub fn open(path: impl AsRef<Path>, record_size: usize) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let tail = len % record_size as u64;
        let write_offset = if tail != 0 {
            tracing::warn!("truncating {} torn bytes at the end of {:?}", tail, path);
            file.set_len(len - tail)?;
            len - tail
        } else {
            len
        };

        Ok(Self {
            file,
            path,
            record_size,
            write_offset,
        })
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn record_count(&self) -> u64 {
        self.write_offset / self.record_size as u64
    }

    /// Append a record and return its byte offset.
    pub fn write(&mut self, record: &[u8]) -> DbResult<u64> {
        self.check_record(record)?;
        let offset = self.write_offset;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(record)?;
        self.write_offset += self.record_size as u64;
        Ok(offset)
    }

    /// Rewrite the record at `offset` in place.
    pub fn overwrite(&mut self, offset: u64, record: &[u8]) -> DbResult<()> {
        self.check_record(record)?;
        self.check_offset(offset)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(record)?;
        Ok(())
    }

    /// Read the record at `offset`.
    pub fn read(&mut self, offset: u64) -> DbResult<Vec<u8>> {
        self.check_offset(offset)?;
        let mut buf = vec![0u8; self.record_size];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Flush buffered writes to stable storage.
    pub fn sync(&mut self) -> DbResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `offset` addresses a whole record.
    pub fn contains_offset(&self, offset: u64) -> bool {
        self.check_offset(offset).is_ok()
    }

    fn check_record(&self, record: &[u8]) -> DbResult<()> {
        if record.len() != self.record_size {
            return Err(DbError::InvalidArgument(format!(
                "metadata record is {} bytes, heap expects {}",
                record.len(),
                self.record_size
            )));
        }
        Ok(())
    }

    fn check_offset(&self, offset: u64) -> DbResult<()> {
        let aligned = offset % self.record_size as u64 == 0;
        if !aligned || offset + self.record_size as u64 > self.write_offset {
            return Err(DbError::Corruption(format!(
                "offset {} does not address a metadata record",
                offset
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn series(ts_length: usize, seed: f64) -> TimeSeries {
        let times: Vec<f64> = (0..ts_length).map(|i| i as f64).collect();
        let values: Vec<f64> = (0..ts_length).map(|i| seed + i as f64 * 0.5).collect();
        TimeSeries::new(times, values).unwrap()
    }

    #[test]
    fn test_ts_heap_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap_ts.met");

        let mut heap = TsHeap::open(&path, 8).unwrap();
        let a = series(8, 1.0);
        let b = series(8, 100.0);

        let off_a = heap.write(&a).unwrap();
        let off_b = heap.write(&b).unwrap();
        assert_eq!(off_a, 8);
        assert_eq!(off_b, 8 + 16 * 8);
        assert_eq!(heap.record_count(), 2);

        assert_eq!(heap.read(off_a).unwrap(), a);
        assert_eq!(heap.read(off_b).unwrap(), b);
    }

    #[test]
    fn test_ts_heap_length_verified() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap_ts.met");

        {
            let mut heap = TsHeap::open(&path, 8).unwrap();
            heap.write(&series(8, 0.0)).unwrap();
        }

        let err = TsHeap::open(&path, 16).unwrap_err();
        assert_eq!(err.kind(), "SchemaMismatch");
    }

    #[test]
    fn test_ts_heap_wrong_length_series_rejected() {
        let dir = tempdir().unwrap();
        let mut heap = TsHeap::open(dir.path().join("heap_ts.met"), 8).unwrap();
        let err = heap.write(&series(4, 0.0)).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn test_ts_heap_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap_ts.met");

        {
            let mut heap = TsHeap::open(&path, 8).unwrap();
            heap.write(&series(8, 0.0)).unwrap();
            heap.sync().unwrap();
        }

        // simulate a crash mid-append
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len + 40).unwrap();
        }

        let mut heap = TsHeap::open(&path, 8).unwrap();
        assert_eq!(heap.record_count(), 1);
        assert_eq!(heap.read(8).unwrap(), series(8, 0.0));
    }

    #[test]
    fn test_ts_heap_bad_offset() {
        let dir = tempdir().unwrap();
        let mut heap = TsHeap::open(dir.path().join("heap_ts.met"), 8).unwrap();
        heap.write(&series(8, 0.0)).unwrap();

        assert!(heap.read(9).is_err()); // misaligned
        assert!(heap.read(8 + 16 * 8).is_err()); // past the end
    }

    #[test]
    fn test_meta_heap_roundtrip_and_overwrite() {
        let dir = tempdir().unwrap();
        let mut heap = MetaHeap::open(dir.path().join("heap_meta.met"), 4).unwrap();

        let off_a = heap.write(&[1, 2, 3, 4]).unwrap();
        let off_b = heap.write(&[5, 6, 7, 8]).unwrap();
        assert_eq!(off_a, 0);
        assert_eq!(off_b, 4);

        assert_eq!(heap.read(off_a).unwrap(), vec![1, 2, 3, 4]);

        heap.overwrite(off_a, &[9, 9, 9, 9]).unwrap();
        assert_eq!(heap.read(off_a).unwrap(), vec![9, 9, 9, 9]);
        assert_eq!(heap.read(off_b).unwrap(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_meta_heap_record_size_enforced() {
        let dir = tempdir().unwrap();
        let mut heap = MetaHeap::open(dir.path().join("heap_meta.met"), 4).unwrap();
        assert!(heap.write(&[1, 2, 3]).is_err());
        assert!(heap.write(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn test_meta_heap_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap_meta.met");

        {
            let mut heap = MetaHeap::open(&path, 4).unwrap();
            heap.write(&[1, 2, 3, 4]).unwrap();
            heap.sync().unwrap();
        }
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(6).unwrap();
        }

        let heap = MetaHeap::open(&path, 4).unwrap();
        assert_eq!(heap.record_count(), 1);
    }
}
