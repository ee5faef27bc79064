// Transaction Extraction
//
// Pull-based cursor over a chain of log segments. Produces committed
// transactions in strictly increasing id order, one at a time, into a
// caller-owned buffer. Segment boundaries are invisible to the caller.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use super::reader::SegmentReader;
use super::{LogError, TxId};

/// Errors that end an extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("log read failed: {0}")]
    Log(#[from] LogError),

    #[error("transaction {expected} missing from log, found {found}")]
    Gap { expected: TxId, found: TxId },

    #[error("transaction {found} out of order after {previous}")]
    OutOfOrder { previous: TxId, found: TxId },

    #[error("log chain ends before transaction {expected}")]
    Exhausted { expected: TxId },
}

/// Payload buffer reused across extractions.
///
/// Reset before every extraction so bytes of one transaction never
/// show up in the next.
#[derive(Debug, Default)]
pub struct TxBuffer {
    bytes: Vec<u8>,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }
}

/// Sequential source of committed transactions.
pub trait TransactionCursor {
    /// Read the next transaction into `buffer` and return its id.
    ///
    /// `Ok(None)` once the cursor is exhausted; every later call
    /// returns `Ok(None)` as well.
    fn extract_next(&mut self, buffer: &mut TxBuffer) -> Result<Option<TxId>, ExtractError>;
}

/// Cursor over the segments of one log directory, bounded to `[start, end]`.
pub struct LogExtractor {
    dir: PathBuf,
    prefix: String,
    next_segment: u64,
    last_segment: u64,
    current: Option<SegmentReader>,
    next_tx: TxId,
    end: TxId,
    previous: Option<TxId>,
}

impl LogExtractor {
    /// Cursor yielding transactions `start..=end` from `segments`.
    ///
    /// Segments are opened lazily; nothing is read until the first
    /// call to `extract_next`.
    pub fn new(
        dir: &Path,
        prefix: &str,
        segments: RangeInclusive<u64>,
        start: TxId,
        end: TxId,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_owned(),
            next_segment: *segments.start(),
            last_segment: *segments.end(),
            current: None,
            next_tx: start,
            end,
            previous: None,
        }
    }

    fn drained(&self) -> bool {
        self.next_tx > self.end
    }

    fn open_next_segment(&mut self) -> Result<SegmentReader, ExtractError> {
        if self.next_segment > self.last_segment {
            return Err(ExtractError::Exhausted {
                expected: self.next_tx,
            });
        }
        let reader = SegmentReader::open(&self.dir, &self.prefix, self.next_segment)?;
        tracing::trace!(segment = self.next_segment, "reading log segment");
        self.next_segment += 1;
        Ok(reader)
    }
}

impl TransactionCursor for LogExtractor {
    fn extract_next(&mut self, buffer: &mut TxBuffer) -> Result<Option<TxId>, ExtractError> {
        if self.drained() {
            return Ok(None);
        }

        loop {
            let reader = match &mut self.current {
                Some(reader) => reader,
                None => {
                    let reader = self.open_next_segment()?;
                    self.current.insert(reader)
                }
            };

            buffer.reset();
            let Some(tx_id) = reader.read_entry(buffer.bytes_mut())? else {
                self.current = None;
                continue;
            };

            if let Some(previous) = self.previous {
                if tx_id <= previous {
                    return Err(ExtractError::OutOfOrder {
                        previous,
                        found: tx_id,
                    });
                }
            }
            self.previous = Some(tx_id);

            if tx_id < self.next_tx {
                continue;
            }
            if tx_id > self.next_tx {
                return Err(ExtractError::Gap {
                    expected: self.next_tx,
                    found: tx_id,
                });
            }

            self.next_tx += 1;
            return Ok(Some(tx_id));
        }
    }
}

/// Id of the last transaction stored in `segments`, or `None` if
/// every segment is empty.
pub fn last_tx_id(
    dir: &Path,
    prefix: &str,
    segments: RangeInclusive<u64>,
) -> Result<Option<TxId>, LogError> {
    let mut payload = Vec::new();
    for ordinal in segments.rev() {
        let mut reader = SegmentReader::open(dir, prefix, ordinal)?;
        let mut last = None;
        while let Some(tx_id) = reader.read_entry(&mut payload)? {
            last = Some(tx_id);
        }
        if last.is_some() {
            return Ok(last);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{find_max_log_id, LogWriter, ENTRY_HEADER_LEN, LOG_NAME_PREFIX, SEGMENT_HEADER_LEN};
    use tempfile::TempDir;

    fn payload(tx_id: TxId) -> Vec<u8> {
        format!("tx-{tx_id}").into_bytes()
    }

    /// Log with transactions `first..=last`, three entries per segment.
    fn write_log(dir: &Path, first: TxId, last: TxId) -> u64 {
        let entry = (ENTRY_HEADER_LEN + payload(last).len()) as u64;
        let threshold = SEGMENT_HEADER_LEN as u64 + 3 * entry;
        let mut writer = LogWriter::create(dir, LOG_NAME_PREFIX, 0, threshold).unwrap();
        for tx_id in first..=last {
            writer.append(tx_id, &payload(tx_id)).unwrap();
        }
        find_max_log_id(dir, LOG_NAME_PREFIX).unwrap()
    }

    fn drain(extractor: &mut LogExtractor) -> Vec<(TxId, Vec<u8>)> {
        let mut buffer = TxBuffer::new();
        let mut out = Vec::new();
        while let Some(tx_id) = extractor.extract_next(&mut buffer).unwrap() {
            out.push((tx_id, buffer.as_bytes().to_vec()));
        }
        out
    }

    #[test]
    fn yields_bounded_range_across_segments() {
        let dir = TempDir::new().unwrap();
        let max = write_log(dir.path(), 2, 20);
        assert!(max > 0);

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=max, 5, 17);
        let extracted = drain(&mut extractor);

        let ids: Vec<TxId> = extracted.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, (5..=17).collect::<Vec<_>>());
        for (tx_id, bytes) in extracted {
            assert_eq!(bytes, payload(tx_id));
        }
    }

    #[test]
    fn crosses_empty_segments() {
        let dir = TempDir::new().unwrap();
        let mut writer = LogWriter::create(dir.path(), LOG_NAME_PREFIX, 0, u64::MAX).unwrap();
        writer.append(2, &payload(2)).unwrap();
        writer.rotate().unwrap();
        writer.rotate().unwrap();
        writer.append(3, &payload(3)).unwrap();
        writer.rotate().unwrap();

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=3, 2, 3);
        let ids: Vec<TxId> = drain(&mut extractor).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn stays_exhausted() {
        let dir = TempDir::new().unwrap();
        let max = write_log(dir.path(), 2, 4);

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=max, 2, 4);
        let mut buffer = TxBuffer::new();
        assert_eq!(drain(&mut extractor).len(), 3);
        assert_eq!(extractor.extract_next(&mut buffer).unwrap(), None);
        assert_eq!(extractor.extract_next(&mut buffer).unwrap(), None);
    }

    #[test]
    fn empty_range_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let max = write_log(dir.path(), 2, 4);

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=max, 2, 1);
        assert!(drain(&mut extractor).is_empty());
    }

    #[test]
    fn chain_ending_early_is_exhausted_error() {
        let dir = TempDir::new().unwrap();
        let max = write_log(dir.path(), 2, 6);

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=max, 2, 9);
        let mut buffer = TxBuffer::new();
        for _ in 2..=6 {
            extractor.extract_next(&mut buffer).unwrap().unwrap();
        }
        let err = extractor.extract_next(&mut buffer).unwrap_err();
        assert!(matches!(err, ExtractError::Exhausted { expected: 7 }));
    }

    #[test]
    fn missing_transaction_is_gap() {
        let dir = TempDir::new().unwrap();
        let mut writer = LogWriter::create(dir.path(), LOG_NAME_PREFIX, 0, u64::MAX).unwrap();
        writer.append(2, b"a").unwrap();
        writer.append(4, b"c").unwrap();

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=0, 2, 4);
        let mut buffer = TxBuffer::new();
        assert_eq!(extractor.extract_next(&mut buffer).unwrap(), Some(2));
        let err = extractor.extract_next(&mut buffer).unwrap_err();
        assert!(matches!(err, ExtractError::Gap { expected: 3, found: 4 }));
    }

    #[test]
    fn start_after_log_begin_is_gap_when_missing() {
        let dir = TempDir::new().unwrap();
        let max = write_log(dir.path(), 10, 12);

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=max, 2, 12);
        let err = extractor.extract_next(&mut TxBuffer::new()).unwrap_err();
        assert!(matches!(err, ExtractError::Gap { expected: 2, found: 10 }));
    }

    #[test]
    fn buffer_does_not_leak_previous_payload() {
        let dir = TempDir::new().unwrap();
        let mut writer = LogWriter::create(dir.path(), LOG_NAME_PREFIX, 0, u64::MAX).unwrap();
        writer.append(2, b"a much longer payload").unwrap();
        writer.append(3, b"short").unwrap();

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=0, 2, 3);
        let mut buffer = TxBuffer::new();
        extractor.extract_next(&mut buffer).unwrap();
        extractor.extract_next(&mut buffer).unwrap();
        assert_eq!(buffer.as_bytes(), b"short");
    }

    #[test]
    fn corrupt_segment_fails_extraction() {
        let dir = TempDir::new().unwrap();
        let max = write_log(dir.path(), 2, 10);
        std::fs::write(
            crate::log::segment_path(dir.path(), LOG_NAME_PREFIX, 1),
            b"garbage",
        )
        .unwrap();

        let mut extractor = LogExtractor::new(dir.path(), LOG_NAME_PREFIX, 0..=max, 2, 10);
        let mut buffer = TxBuffer::new();
        let err = loop {
            match extractor.extract_next(&mut buffer) {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("corruption went unnoticed"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ExtractError::Log(LogError::BadHeader { .. })));
    }

    #[test]
    fn last_tx_id_skips_empty_tail_segment() {
        let dir = TempDir::new().unwrap();
        let mut writer = LogWriter::create(dir.path(), LOG_NAME_PREFIX, 0, u64::MAX).unwrap();
        writer.append(2, b"a").unwrap();
        writer.append(3, b"b").unwrap();
        writer.rotate().unwrap();

        assert_eq!(last_tx_id(dir.path(), LOG_NAME_PREFIX, 0..=1).unwrap(), Some(3));
    }

    #[test]
    fn last_tx_id_of_empty_log() {
        let dir = TempDir::new().unwrap();
        LogWriter::create(dir.path(), LOG_NAME_PREFIX, 0, u64::MAX).unwrap();
        assert_eq!(last_tx_id(dir.path(), LOG_NAME_PREFIX, 0..=0).unwrap(), None);
    }
}
