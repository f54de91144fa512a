use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 16; // 8 bytes for min index + 8 bytes for max index
const RECORD_HEADER_SIZE: u64 = 16; // 8 bytes for entry index + 8 bytes for entry size

/// An append-only file of raft log records.
///
/// Records are written in the order raft hands them over, including
/// overwrites of a conflicting tail, so replaying every segment in sequence
/// rebuilds the log.
#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    min_index: u64,
    max_index: u64,
    size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    min_index: u64,
    max_index: u64,
}

impl Segment {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            path: path.as_ref().to_path_buf(),
            min_index: 0,
            max_index: 0,
            size: HEADER_SIZE,
        };

        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.size = segment.file.metadata()?.len();
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            min_index: self.min_index,
            max_index: self.max_index,
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.min_index = header.min_index;
        self.max_index = header.max_index;
        Ok(())
    }

    /// Appends `(index, bytes)` records and flushes them to disk
    pub fn append(&mut self, records: &[(u64, Vec<u8>)]) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.size))?;

        let mut buf = Vec::new();
        for (index, data) in records {
            buf.extend_from_slice(&index.to_le_bytes());
            buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
            buf.extend_from_slice(data);

            if self.min_index == 0 || *index < self.min_index {
                self.min_index = *index;
            }
            self.max_index = self.max_index.max(*index);
        }
        self.file.write_all(&buf)?;
        self.size += buf.len() as u64;

        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads every complete record. A torn record at the tail, left by a crash
    /// in the middle of an append, is cut off.
    pub fn read_all(&mut self) -> io::Result<Vec<(u64, Vec<u8>)>> {
        let len = self.file.metadata()?.len();
        let mut records = Vec::new();
        let mut pos = HEADER_SIZE;

        self.file.seek(SeekFrom::Start(pos))?;
        while pos + RECORD_HEADER_SIZE <= len {
            let mut header = [0u8; RECORD_HEADER_SIZE as usize];
            self.file.read_exact(&mut header)?;
            let index = u64::from_le_bytes(header[..8].try_into().unwrap_or_default());
            let size = u64::from_le_bytes(header[8..].try_into().unwrap_or_default());
            if pos + RECORD_HEADER_SIZE + size > len {
                break;
            }
            let mut data = vec![0u8; size as usize];
            self.file.read_exact(&mut data)?;
            records.push((index, data));
            pos += RECORD_HEADER_SIZE + size;
        }

        if pos < len {
            log::warn!(
                "Truncating torn tail of raft log segment {:?} at {}",
                self.path,
                pos
            );
            self.file.set_len(pos)?;
        }
        self.size = pos;
        Ok(records)
    }

    pub fn min_index(&self) -> u64 {
        self.min_index
    }

    pub fn max_index(&self) -> u64 {
        self.max_index
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == HEADER_SIZE
    }

    pub fn remove(self) -> io::Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_segment_creation() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::open(dir.path().join("segment_1.log")).unwrap();

        assert_eq!(segment.min_index(), 0);
        assert_eq!(segment.max_index(), 0);
        assert!(segment.is_empty());
    }

    #[test]
    fn test_segment_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment_1.log");
        {
            let mut segment = Segment::open(&path).unwrap();
            segment
                .append(&[(1, b"first entry".to_vec()), (2, b"second entry".to_vec())])
                .unwrap();
            segment.append(&[(2, b"overwritten".to_vec())]).unwrap();
            assert_eq!(segment.max_index(), 2);
        }

        let mut segment = Segment::open(&path).unwrap();
        assert_eq!(segment.min_index(), 1);
        assert_eq!(segment.max_index(), 2);
        let records = segment.read_all().unwrap();
        assert_eq!(
            records,
            vec![
                (1, b"first entry".to_vec()),
                (2, b"second entry".to_vec()),
                (2, b"overwritten".to_vec()),
            ]
        );
    }

    #[test]
    fn test_segment_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment_1.log");
        {
            let mut segment = Segment::open(&path).unwrap();
            segment.append(&[(1, b"whole".to_vec())]).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&2u64.to_le_bytes()).unwrap();
            file.write_all(&100u64.to_le_bytes()).unwrap();
            file.write_all(b"torn").unwrap();
        }

        let mut segment = Segment::open(&path).unwrap();
        assert_eq!(segment.read_all().unwrap(), vec![(1, b"whole".to_vec())]);
        segment.append(&[(2, b"again".to_vec())]).unwrap();
        assert_eq!(segment.read_all().unwrap().len(), 2);
    }
}
