// File-Backed Store
//
// A store directory holds:
// - store.meta    metadata; its presence marks the directory as a store
// - records.json  key/value snapshot as of the last checkpoint
// - txlog.vN      transaction log segments
// - store.lock    present while the store is open
//
// Transactions are logged before they touch the records. Opening a
// store replays any logged transaction past the last checkpoint.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::lock::DirLock;
use super::redo::{self, decode_redo, Records, StagedChanges};
use super::{
    ApplyError, StoreAccess, StoreConfig, StoreError, TransactionApply, VerificationLevel,
};
use crate::log::{
    last_tx_id, segment_path, segment_range, LogExtractor, LogWriter, TransactionCursor,
    TxBuffer, TxId, BOOTSTRAP_TX_ID,
};

pub const META_FILE: &str = "store.meta";
pub const RECORDS_FILE: &str = "records.json";

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub format_version: u32,
    /// Last transaction reflected in the records snapshot.
    pub last_committed_tx: TxId,
}

/// Whether `dir` already holds a store.
pub fn directory_contains_store(dir: &Path) -> bool {
    dir.join(META_FILE).is_file()
}

pub struct FileStore {
    dir: PathBuf,
    config: StoreConfig,
    records: Records,
    last_committed: TxId,
    checkpointed: TxId,
    writer: Option<LogWriter>,
    lock: Option<DirLock>,
}

impl FileStore {
    /// Create a new, empty store in `dir`.
    ///
    /// The directory is created if needed; an existing store is never
    /// touched.
    pub fn create(dir: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        if directory_contains_store(dir) {
            return Err(StoreError::AlreadyExists {
                dir: dir.to_path_buf(),
            });
        }
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let lock = DirLock::acquire(dir)?;
        let writer = LogWriter::create(dir, &config.log_prefix, 0, config.log_rotation_threshold)?;

        let mut store = Self {
            dir: dir.to_path_buf(),
            config,
            records: Records::new(),
            last_committed: BOOTSTRAP_TX_ID,
            checkpointed: BOOTSTRAP_TX_ID,
            writer: Some(writer),
            lock: Some(lock),
        };
        store.checkpoint()?;

        tracing::info!(dir = %dir.display(), "created store");
        Ok(store)
    }

    /// Open an existing store and recover it from its log.
    pub fn open(dir: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        if !directory_contains_store(dir) {
            return Err(StoreError::NotAStore {
                dir: dir.to_path_buf(),
            });
        }

        let lock = DirLock::acquire(dir)?;
        let meta: StoreMeta = read_json(&dir.join(META_FILE))?;
        let records: Records = read_json(&dir.join(RECORDS_FILE))?;

        let mut store = Self {
            dir: dir.to_path_buf(),
            config,
            records,
            last_committed: meta.last_committed_tx,
            checkpointed: meta.last_committed_tx,
            writer: None,
            lock: Some(lock),
        };
        store.recover()?;
        Ok(store)
    }

    fn recover(&mut self) -> Result<(), StoreError> {
        let prefix = self.config.log_prefix.clone();
        let threshold = self.config.log_rotation_threshold;

        let Some(segments) = segment_range(&self.dir, &prefix)? else {
            self.writer = Some(LogWriter::create(&self.dir, &prefix, 0, threshold)?);
            return Ok(());
        };

        let logged = last_tx_id(&self.dir, &prefix, segments.clone())?;
        if let Some(last) = logged.filter(|last| *last > self.last_committed) {
            let from = self.last_committed + 1;
            let mut extractor =
                LogExtractor::new(&self.dir, &prefix, segments.clone(), from, last);
            let mut buffer = TxBuffer::new();
            while let Some(tx_id) = extractor.extract_next(&mut buffer)? {
                let staged = stage_payload(&self.records, tx_id, buffer.as_bytes())?;
                redo::commit(&mut self.records, staged);
                self.last_committed = tx_id;
            }
            tracing::info!(from, to = last, "recovered transactions from log");
        }

        self.writer = Some(LogWriter::open_append(
            &self.dir,
            &prefix,
            *segments.end(),
            Some(self.last_committed),
            threshold,
        )?);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock.is_some()
    }

    /// Write the records snapshot and metadata for the current state.
    pub fn checkpoint(&mut self) -> Result<(), StoreError> {
        write_json(&self.dir.join(RECORDS_FILE), &self.records)?;
        write_json(
            &self.dir.join(META_FILE),
            &StoreMeta {
                format_version: STORE_FORMAT_VERSION,
                last_committed_tx: self.last_committed,
            },
        )?;
        self.checkpointed = self.last_committed;
        Ok(())
    }

    /// Checkpoint, prune old log segments unless they are kept, and
    /// release the directory. Calling it again is a no-op.
    pub fn shutdown(&mut self) -> Result<(), StoreError> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };

        let closed = self.close_files();
        lock.release()?;
        closed?;

        tracing::info!(
            dir = %self.dir.display(),
            last_committed = self.last_committed,
            "store shut down"
        );
        Ok(())
    }

    fn close_files(&mut self) -> Result<(), StoreError> {
        self.writer = None;
        if self.last_committed != self.checkpointed {
            self.checkpoint()?;
        }
        if !self.config.keep_logical_logs {
            self.prune_logs()?;
        }
        Ok(())
    }

    fn prune_logs(&self) -> Result<(), StoreError> {
        let prefix = &self.config.log_prefix;
        let Some(segments) = segment_range(&self.dir, prefix)? else {
            return Ok(());
        };

        let newest = *segments.end();
        for ordinal in *segments.start()..newest {
            let path = segment_path(&self.dir, prefix, ordinal);
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        if newest > *segments.start() {
            tracing::info!(kept = newest, "pruned logical logs");
        }
        Ok(())
    }
}

impl TransactionApply for FileStore {
    fn apply_committed_transaction(&mut self, tx_id: TxId, payload: &[u8]) -> Result<(), ApplyError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(ApplyError::Closed);
        };

        if tx_id <= self.last_committed {
            tracing::debug!(tx_id, "transaction already applied, ignoring");
            return Ok(());
        }
        let expected = self.last_committed + 1;
        if tx_id != expected {
            return Err(ApplyError::OutOfOrder {
                expected,
                found: tx_id,
            });
        }

        let staged = stage_payload(&self.records, tx_id, payload)?;
        writer
            .append(tx_id, payload)
            .map_err(|source| ApplyError::Log { tx_id, source })?;
        if self.config.verification == VerificationLevel::FullWithLogging {
            writer
                .verify_last(tx_id, payload)
                .map_err(|source| ApplyError::Verification { tx_id, source })?;
        }

        let changes = staged.len();
        redo::commit(&mut self.records, staged);
        self.last_committed = tx_id;

        tracing::debug!(tx_id, changes, segment = writer.current_segment(), "applied transaction");
        Ok(())
    }
}

impl StoreAccess for FileStore {
    fn directory(&self) -> &Path {
        &self.dir
    }

    fn log_prefix(&self) -> &str {
        &self.config.log_prefix
    }

    fn records(&self) -> &Records {
        &self.records
    }

    fn last_committed_tx_id(&self) -> TxId {
        self.last_committed
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if self.lock.is_some() {
            if let Err(e) = self.shutdown() {
                tracing::warn!(dir = %self.dir.display(), error = %e, "store shutdown failed");
            }
        }
    }
}

fn stage_payload(records: &Records, tx_id: TxId, payload: &[u8]) -> Result<StagedChanges, ApplyError> {
    let ops = decode_redo(payload).map_err(|e| ApplyError::MalformedPayload {
        tx_id,
        reason: e.to_string(),
    })?;
    redo::stage(records, &ops).map_err(|source| ApplyError::Constraint { tx_id, source })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Format {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Format {
        path: path.to_path_buf(),
        source,
    })?;

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    let mut file = File::create(&staging).map_err(|e| StoreError::io(&staging, e))?;
    file.write_all(&bytes).map_err(|e| StoreError::io(&staging, e))?;
    file.sync_all().map_err(|e| StoreError::io(&staging, e))?;
    fs::rename(&staging, path).map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{find_max_log_id, ENTRY_HEADER_LEN, LOG_NAME_PREFIX, SEGMENT_HEADER_LEN};
    use crate::store::redo::{encode_redo, RedoOp};
    use crate::store::LOCK_FILE;
    use tempfile::TempDir;

    fn put(key: &str, value: &str) -> Vec<u8> {
        encode_redo(&[RedoOp::Put {
            key: key.into(),
            value: value.into(),
        }])
        .unwrap()
    }

    fn delete(key: &str) -> Vec<u8> {
        encode_redo(&[RedoOp::Delete { key: key.into() }]).unwrap()
    }

    fn small_segments() -> StoreConfig {
        StoreConfig {
            log_rotation_threshold: SEGMENT_HEADER_LEN as u64 + 2 * (ENTRY_HEADER_LEN as u64 + 48),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn create_starts_after_bootstrap() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::create(dir.path(), StoreConfig::default()).unwrap();

        assert_eq!(store.last_committed_tx_id(), BOOTSTRAP_TX_ID);
        assert!(store.records().is_empty());
        assert!(directory_contains_store(dir.path()));
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn create_refuses_existing_store() {
        let dir = TempDir::new().unwrap();
        FileStore::create(dir.path(), StoreConfig::default())
            .unwrap()
            .shutdown()
            .unwrap();

        let err = FileStore::create(dir.path(), StoreConfig::default()).err().unwrap();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[test]
    fn applies_in_order_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileStore::create(dir.path(), StoreConfig::default()).unwrap();
            store.apply_committed_transaction(2, &put("a", "1")).unwrap();
            store.apply_committed_transaction(3, &put("b", "2")).unwrap();
            store.apply_committed_transaction(4, &delete("a")).unwrap();
            store.shutdown().unwrap();
        }

        let store = FileStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.last_committed_tx_id(), 4);
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.records().get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn duplicate_is_ignored_and_gap_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::create(dir.path(), StoreConfig::default()).unwrap();
        store.apply_committed_transaction(2, &put("a", "1")).unwrap();

        store.apply_committed_transaction(2, &put("a", "changed")).unwrap();
        assert_eq!(store.records().get("a").map(String::as_str), Some("1"));

        let err = store.apply_committed_transaction(4, &put("c", "3")).unwrap_err();
        assert!(matches!(err, ApplyError::OutOfOrder { expected: 3, found: 4 }));
    }

    #[test]
    fn malformed_payload_is_rejected_before_logging() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::create(dir.path(), StoreConfig::default()).unwrap();

        let err = store.apply_committed_transaction(2, b"\x00\x01").unwrap_err();
        assert!(matches!(err, ApplyError::MalformedPayload { tx_id: 2, .. }));

        let err = store.apply_committed_transaction(2, &delete("ghost")).unwrap_err();
        assert!(matches!(err, ApplyError::Constraint { tx_id: 2, .. }));

        assert_eq!(store.last_committed_tx_id(), BOOTSTRAP_TX_ID);
        assert_eq!(
            last_tx_id(dir.path(), LOG_NAME_PREFIX, 0..=0).unwrap(),
            None
        );
    }

    #[test]
    fn full_verification_reads_back_each_transaction() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            verification: VerificationLevel::FullWithLogging,
            ..small_segments()
        };
        let mut store = FileStore::create(dir.path(), config).unwrap();
        for tx_id in 2..=9 {
            store
                .apply_committed_transaction(tx_id, &put(&format!("k{tx_id}"), "v"))
                .unwrap();
        }
        assert_eq!(store.records().len(), 8);
    }

    #[test]
    fn reopen_replays_log_past_checkpoint() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileStore::create(dir.path(), StoreConfig::default()).unwrap();
            store.apply_committed_transaction(2, &put("a", "1")).unwrap();
            store.shutdown().unwrap();
        }

        // A transaction that reached the log but not the snapshot.
        {
            let mut writer =
                LogWriter::open_append(dir.path(), LOG_NAME_PREFIX, 0, Some(2), u64::MAX).unwrap();
            writer.append(3, &put("b", "2")).unwrap();
        }

        let mut store = FileStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.last_committed_tx_id(), 3);
        assert_eq!(store.records().get("b").map(String::as_str), Some("2"));

        store.apply_committed_transaction(4, &put("c", "3")).unwrap();
        assert_eq!(store.last_committed_tx_id(), 4);
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let _store = FileStore::create(dir.path(), StoreConfig::default()).unwrap();

        let err = FileStore::open(dir.path(), StoreConfig::default()).err().unwrap();
        assert!(matches!(err, StoreError::Locked { .. }));
    }

    #[test]
    fn apply_after_shutdown_fails() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::create(dir.path(), StoreConfig::default()).unwrap();
        store.shutdown().unwrap();
        store.shutdown().unwrap();

        assert!(!store.is_open());
        assert!(matches!(
            store.apply_committed_transaction(2, &put("a", "1")),
            Err(ApplyError::Closed)
        ));
    }

    #[test]
    fn shutdown_prunes_logs_unless_kept() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            keep_logical_logs: false,
            ..small_segments()
        };
        {
            let mut store = FileStore::create(dir.path(), config.clone()).unwrap();
            for tx_id in 2..=12 {
                store
                    .apply_committed_transaction(tx_id, &put(&format!("k{tx_id}"), "v"))
                    .unwrap();
            }
            store.shutdown().unwrap();
        }

        let segments = segment_range(dir.path(), LOG_NAME_PREFIX).unwrap().unwrap();
        assert!(*segments.start() > 0);
        assert_eq!(segments.start(), segments.end());
        assert!(find_max_log_id(dir.path(), LOG_NAME_PREFIX).is_err());

        let mut store = FileStore::open(dir.path(), config).unwrap();
        assert_eq!(store.last_committed_tx_id(), 12);
        store.apply_committed_transaction(13, &put("k13", "v")).unwrap();
    }

    #[test]
    fn kept_logs_form_complete_chain() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::create(dir.path(), small_segments()).unwrap();
        for tx_id in 2..=12 {
            store
                .apply_committed_transaction(tx_id, &put(&format!("k{tx_id}"), "v"))
                .unwrap();
        }
        store.shutdown().unwrap();

        let max = find_max_log_id(dir.path(), LOG_NAME_PREFIX).unwrap();
        assert!(max > 0);
        assert_eq!(last_tx_id(dir.path(), LOG_NAME_PREFIX, 0..=max).unwrap(), Some(12));
    }
}
