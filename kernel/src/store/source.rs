// Replay Source
//
// A store directory opened only to host log reading for a rebuild.
// It must be opened with logical logs kept, validates the segment
// chain up front and holds the directory lock until shut down.

use std::path::{Path, PathBuf};

use super::lock::DirLock;
use super::{StoreConfig, StoreError, TransactionSource};
use crate::log::{find_max_log_id, last_tx_id, ExtractError, LogExtractor, TxId, BOOTSTRAP_TX_ID};

pub struct LogSource {
    dir: PathBuf,
    prefix: String,
    max_segment: u64,
    last_committed: TxId,
    lock: Option<DirLock>,
}

impl LogSource {
    pub fn open(dir: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        if !config.keep_logical_logs {
            return Err(StoreError::LogsNotRetained {
                dir: dir.to_path_buf(),
            });
        }

        let lock = DirLock::acquire(dir)?;
        let max_segment = find_max_log_id(dir, &config.log_prefix)?;
        let last_committed =
            last_tx_id(dir, &config.log_prefix, 0..=max_segment)?.unwrap_or(BOOTSTRAP_TX_ID);

        tracing::info!(
            dir = %dir.display(),
            segments = max_segment + 1,
            last_committed,
            "opened replay source"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: config.log_prefix.clone(),
            max_segment,
            last_committed,
            lock: Some(lock),
        })
    }

    pub fn max_segment(&self) -> u64 {
        self.max_segment
    }

    pub fn is_open(&self) -> bool {
        self.lock.is_some()
    }
}

impl TransactionSource for LogSource {
    type Cursor = LogExtractor;

    fn last_committed_tx_id(&self) -> TxId {
        self.last_committed
    }

    fn log_extractor(&self, start: TxId, end: TxId) -> Result<LogExtractor, ExtractError> {
        Ok(LogExtractor::new(
            &self.dir,
            &self.prefix,
            0..=self.max_segment,
            start,
            end,
        ))
    }

    fn shutdown(&mut self) -> Result<(), StoreError> {
        match self.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        }
    }
}
