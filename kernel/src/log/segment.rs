// Log Chain Validation
//
// Discovers numbered log segments in a directory and checks
// that they form an unbroken chain before anything reads them.
// Read-only: nothing here touches the files themselves.

use std::fs;
use std::io;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Default file name prefix of a log segment; the ordinal follows it.
pub const LOG_NAME_PREFIX: &str = "txlog.v";

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("cannot list log directory {dir}: {source}")]
    Io {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("inconsistent number of log files found in {dir}: no log segments")]
    Empty { dir: PathBuf },

    #[error("inconsistent number of log files found in {dir}: segment {ordinal} missing (highest is {max})")]
    Missing { dir: PathBuf, ordinal: u64, max: u64 },

    #[error("inconsistent number of log files found in {dir}: malformed segment name {name:?}")]
    MalformedName { dir: PathBuf, name: String },
}

/// Whether `name` belongs to the segment family identified by `prefix`.
pub fn is_log_segment(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix)
}

/// Ordinal encoded in a segment file name.
///
/// Only canonical decimal ordinals are accepted: `txlog.v0`, `txlog.v12`,
/// but not `txlog.v012` or `txlog.v1.bak`.
pub fn segment_ordinal(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

pub fn segment_file_name(prefix: &str, ordinal: u64) -> String {
    format!("{prefix}{ordinal}")
}

pub fn segment_path(dir: &Path, prefix: &str, ordinal: u64) -> PathBuf {
    dir.join(segment_file_name(prefix, ordinal))
}

/// Range of segment ordinals present in `dir`, with no holes between
/// the lowest and the highest.
///
/// Returns `Ok(None)` when the directory holds no segment at all.
pub fn segment_range(dir: &Path, prefix: &str) -> Result<Option<RangeInclusive<u64>>, ChainError> {
    let entries = fs::read_dir(dir).map_err(|source| ChainError::Io {
        dir: dir.to_path_buf(),
        source,
    })?;

    let mut bounds: Option<(u64, u64)> = None;
    for entry in entries {
        let entry = entry.map_err(|source| ChainError::Io {
            dir: dir.to_path_buf(),
            source,
        })?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !is_log_segment(&name, prefix) {
            continue;
        }

        let ordinal = segment_ordinal(&name, prefix).ok_or_else(|| ChainError::MalformedName {
            dir: dir.to_path_buf(),
            name: name.clone(),
        })?;
        bounds = Some(match bounds {
            Some((low, high)) => (low.min(ordinal), high.max(ordinal)),
            None => (ordinal, ordinal),
        });
    }

    let Some((low, high)) = bounds else {
        return Ok(None);
    };

    for ordinal in low..=high {
        if !segment_path(dir, prefix, ordinal).is_file() {
            return Err(ChainError::Missing {
                dir: dir.to_path_buf(),
                ordinal,
                max: high,
            });
        }
    }

    Ok(Some(low..=high))
}

/// Highest ordinal of a complete chain `0..=max` in `dir`.
///
/// An empty directory is an invalid chain, never "zero transactions".
pub fn find_max_log_id(dir: &Path, prefix: &str) -> Result<u64, ChainError> {
    let range = segment_range(dir, prefix)?.ok_or_else(|| ChainError::Empty {
        dir: dir.to_path_buf(),
    })?;

    if *range.start() != 0 {
        return Err(ChainError::Missing {
            dir: dir.to_path_buf(),
            ordinal: 0,
            max: *range.end(),
        });
    }

    Ok(*range.end())
}
