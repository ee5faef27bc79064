// Segment Writer
//
// Appends committed transactions to the newest log segment and
// rotates to a fresh segment once the size threshold is reached.
// Every append is synced before it returns.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::reader::SegmentReader;
use super::segment::segment_path;
use super::{encode_entry, encode_segment_header, LogError, TxId, SEGMENT_HEADER_LEN};

pub struct LogWriter {
    dir: PathBuf,
    prefix: String,
    ordinal: u64,
    file: File,
    segment_len: u64,
    rotate_at: u64,
    last_tx: Option<TxId>,
    last_entry_offset: Option<u64>,
    scratch: Vec<u8>,
}

impl LogWriter {
    /// Start a new segment `ordinal`. Fails if the file already exists.
    pub fn create(dir: &Path, prefix: &str, ordinal: u64, rotate_at: u64) -> Result<Self, LogError> {
        let file = create_segment(dir, prefix, ordinal)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_owned(),
            ordinal,
            file,
            segment_len: SEGMENT_HEADER_LEN as u64,
            rotate_at,
            last_tx: None,
            last_entry_offset: None,
            scratch: Vec::new(),
        })
    }

    /// Continue appending to existing segment `ordinal`.
    ///
    /// `last_tx` is the last transaction already in the log, if any.
    pub fn open_append(
        dir: &Path,
        prefix: &str,
        ordinal: u64,
        last_tx: Option<TxId>,
        rotate_at: u64,
    ) -> Result<Self, LogError> {
        // Validates the header before anything is appended behind it.
        SegmentReader::open(dir, prefix, ordinal)?;

        let path = segment_path(dir, prefix, ordinal);
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;
        let segment_len = file.metadata().map_err(|e| LogError::io(&path, e))?.len();

        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_owned(),
            ordinal,
            file,
            segment_len,
            rotate_at,
            last_tx,
            last_entry_offset: None,
            scratch: Vec::new(),
        })
    }

    pub fn current_segment(&self) -> u64 {
        self.ordinal
    }

    /// Append one committed transaction.
    pub fn append(&mut self, tx_id: TxId, payload: &[u8]) -> Result<(), LogError> {
        if let Some(previous) = self.last_tx {
            if tx_id <= previous {
                return Err(LogError::NotIncreasing {
                    previous,
                    found: tx_id,
                });
            }
        }

        self.scratch.clear();
        encode_entry(tx_id, payload, &mut self.scratch)?;

        let has_entries = self.segment_len > SEGMENT_HEADER_LEN as u64;
        if has_entries && self.segment_len + self.scratch.len() as u64 > self.rotate_at {
            self.rotate()?;
        }

        let path = segment_path(&self.dir, &self.prefix, self.ordinal);
        self.file
            .write_all(&self.scratch)
            .map_err(|e| LogError::io(&path, e))?;
        self.file.sync_data().map_err(|e| LogError::io(&path, e))?;

        self.last_entry_offset = Some(self.segment_len);
        self.segment_len += self.scratch.len() as u64;
        self.last_tx = Some(tx_id);
        Ok(())
    }

    /// Close the current segment and continue in the next one.
    pub fn rotate(&mut self) -> Result<(), LogError> {
        let next = self.ordinal + 1;
        self.file = create_segment(&self.dir, &self.prefix, next)?;
        self.ordinal = next;
        self.segment_len = SEGMENT_HEADER_LEN as u64;
        self.last_entry_offset = None;
        tracing::debug!(segment = next, "rotated transaction log");
        Ok(())
    }

    /// Read the most recent entry back from disk and compare it with
    /// what was handed to `append`.
    pub fn verify_last(&self, tx_id: TxId, payload: &[u8]) -> Result<(), LogError> {
        let Some(offset) = self.last_entry_offset else {
            return Err(LogError::Corrupt {
                segment: self.ordinal,
                offset: self.segment_len,
                reason: format!("transaction {tx_id} was not appended to this segment"),
            });
        };

        let mut reader = SegmentReader::open_at(&self.dir, &self.prefix, self.ordinal, offset)?;
        let mut stored = Vec::with_capacity(payload.len());
        match reader.read_entry(&mut stored)? {
            Some(found) if found == tx_id && stored == payload => Ok(()),
            Some(found) => Err(LogError::Corrupt {
                segment: self.ordinal,
                offset,
                reason: format!("read back transaction {found} differs from {tx_id}"),
            }),
            None => Err(LogError::Truncated {
                segment: self.ordinal,
                offset,
            }),
        }
    }
}

fn create_segment(dir: &Path, prefix: &str, ordinal: u64) -> Result<File, LogError> {
    let path = segment_path(dir, prefix, ordinal);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| LogError::io(&path, e))?;

    file.write_all(&encode_segment_header(ordinal))
        .map_err(|e| LogError::io(&path, e))?;
    file.sync_all().map_err(|e| LogError::io(&path, e))?;
    Ok(file)
}
