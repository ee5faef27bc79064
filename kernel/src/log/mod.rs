// Transaction Log
//
// Committed transactions laid out in numbered log segments.
// Each segment starts with a fixed header; each entry carries
// its transaction id, payload length and a checksum.

use std::io;
use std::path::PathBuf;

pub mod extractor;
pub mod reader;
pub mod segment;
pub mod writer;

pub use extractor::{last_tx_id, ExtractError, LogExtractor, TransactionCursor, TxBuffer};
pub use reader::SegmentReader;
pub use segment::{
    find_max_log_id, is_log_segment, segment_file_name, segment_ordinal, segment_path,
    segment_range, ChainError, LOG_NAME_PREFIX,
};
pub use writer::LogWriter;

/// Identifier of a committed transaction.
pub type TxId = u64;

/// Transaction implicitly committed by creating a store.
pub const BOOTSTRAP_TX_ID: TxId = 1;

/// First transaction a rebuild replays into a freshly created store.
pub const FIRST_REPLAYED_TX_ID: TxId = BOOTSTRAP_TX_ID + 1;

pub(crate) const SEGMENT_MAGIC: [u8; 4] = *b"TXLG";
pub(crate) const FORMAT_VERSION: u32 = 1;
pub(crate) const SEGMENT_HEADER_LEN: usize = 16;
pub(crate) const ENTRY_HEADER_LEN: usize = 16;

/// Upper bound on a single transaction payload.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bad segment header in {path}: {reason}")]
    BadHeader { path: PathBuf, reason: String },

    #[error("truncated entry in segment {segment} at offset {offset}")]
    Truncated { segment: u64, offset: u64 },

    #[error("checksum mismatch in segment {segment} at offset {offset}")]
    ChecksumMismatch { segment: u64, offset: u64 },

    #[error("corrupt entry in segment {segment} at offset {offset}: {reason}")]
    Corrupt {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("transaction {found} does not follow {previous}")]
    NotIncreasing { previous: TxId, found: TxId },

    #[error("payload of {len} bytes exceeds the {max} byte limit", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge { len: usize },
}

impl LogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LogError::Io {
            path: path.into(),
            source,
        }
    }
}

pub(crate) fn encode_segment_header(ordinal: u64) -> [u8; SEGMENT_HEADER_LEN] {
    let mut header = [0u8; SEGMENT_HEADER_LEN];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC);
    header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&ordinal.to_le_bytes());
    header
}

/// Checksum over the id, the length and the payload of one entry.
pub(crate) fn entry_checksum(tx_id: TxId, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&tx_id.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

pub(crate) fn encode_entry(tx_id: TxId, payload: &[u8], out: &mut Vec<u8>) -> Result<(), LogError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(LogError::PayloadTooLarge { len: payload.len() });
    }

    out.reserve(ENTRY_HEADER_LEN + payload.len());
    out.extend_from_slice(&tx_id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&entry_checksum(tx_id, payload).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_layout() {
        let mut out = Vec::new();
        encode_entry(7, b"abc", &mut out).unwrap();

        assert_eq!(out.len(), ENTRY_HEADER_LEN + 3);
        assert_eq!(&out[0..8], &7u64.to_le_bytes());
        assert_eq!(&out[8..12], &3u32.to_le_bytes());
        assert_eq!(&out[12..16], &entry_checksum(7, b"abc").to_le_bytes());
        assert_eq!(&out[16..], b"abc");
    }

    #[test]
    fn checksum_covers_tx_id() {
        assert_ne!(entry_checksum(2, b"same"), entry_checksum(3, b"same"));
    }

    #[test]
    fn header_carries_ordinal() {
        let header = encode_segment_header(42);
        assert_eq!(&header[0..4], b"TXLG");
        assert_eq!(u64::from_le_bytes(header[8..16].try_into().unwrap()), 42);
    }
}
