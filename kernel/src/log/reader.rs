// Segment Reader
//
// Sequential reader over the entries of one log segment.
// Distinguishes a clean end of segment from a torn or corrupt entry.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::segment::segment_path;
use super::{
    entry_checksum, LogError, TxId, ENTRY_HEADER_LEN, FORMAT_VERSION, MAX_PAYLOAD_LEN,
    SEGMENT_HEADER_LEN, SEGMENT_MAGIC,
};

pub struct SegmentReader {
    ordinal: u64,
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
}

impl SegmentReader {
    /// Open segment `ordinal` and validate its header.
    pub fn open(dir: &Path, prefix: &str, ordinal: u64) -> Result<Self, LogError> {
        let path = segment_path(dir, prefix, ordinal);
        let file = File::open(&path).map_err(|e| LogError::io(&path, e))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; SEGMENT_HEADER_LEN];
        reader.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                LogError::BadHeader {
                    path: path.clone(),
                    reason: "segment shorter than its header".into(),
                }
            } else {
                LogError::io(&path, e)
            }
        })?;

        if header[0..4] != SEGMENT_MAGIC {
            return Err(LogError::BadHeader {
                path,
                reason: "not a transaction log segment".into(),
            });
        }

        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(LogError::BadHeader {
                path,
                reason: format!("unsupported format version {version}"),
            });
        }

        let mut recorded = [0u8; 8];
        recorded.copy_from_slice(&header[8..16]);
        let recorded = u64::from_le_bytes(recorded);
        if recorded != ordinal {
            return Err(LogError::BadHeader {
                path,
                reason: format!("header names segment {recorded}"),
            });
        }

        Ok(Self {
            ordinal,
            path,
            reader,
            offset: SEGMENT_HEADER_LEN as u64,
        })
    }

    /// Open segment `ordinal` positioned at byte `offset`.
    pub fn open_at(dir: &Path, prefix: &str, ordinal: u64, offset: u64) -> Result<Self, LogError> {
        let mut segment = Self::open(dir, prefix, ordinal)?;
        segment
            .reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| LogError::io(&segment.path, e))?;
        segment.offset = offset;
        Ok(segment)
    }

    /// Read the next entry, replacing the contents of `payload`.
    ///
    /// - `Ok(Some(tx_id))` when an entry was read
    /// - `Ok(None)` at a clean end of segment
    /// - `Err(_)` on a truncated, oversized or corrupt entry
    pub fn read_entry(&mut self, payload: &mut Vec<u8>) -> Result<Option<TxId>, LogError> {
        payload.clear();

        let at_end = self
            .reader
            .fill_buf()
            .map_err(|e| LogError::io(&self.path, e))?
            .is_empty();
        if at_end {
            return Ok(None);
        }

        let mut header = [0u8; ENTRY_HEADER_LEN];
        self.read_exact(&mut header)?;

        let mut id = [0u8; 8];
        id.copy_from_slice(&header[0..8]);
        let tx_id = TxId::from_le_bytes(id);
        let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let checksum = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

        if len > MAX_PAYLOAD_LEN {
            return Err(LogError::Corrupt {
                segment: self.ordinal,
                offset: self.offset,
                reason: format!("entry claims {len} payload bytes"),
            });
        }

        payload.resize(len, 0);
        self.read_exact(payload)?;

        if entry_checksum(tx_id, payload) != checksum {
            return Err(LogError::ChecksumMismatch {
                segment: self.ordinal,
                offset: self.offset,
            });
        }

        self.offset += (ENTRY_HEADER_LEN + len) as u64;
        Ok(Some(tx_id))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LogError> {
        self.reader.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                LogError::Truncated {
                    segment: self.ordinal,
                    offset: self.offset,
                }
            } else {
                LogError::io(&self.path, e)
            }
        })
    }
}
