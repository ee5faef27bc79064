// Store Abstraction
//
// Seams between the replay engine and the stores it reads from and
// writes to. The engine only ever sees transaction ids and opaque
// payload bytes; what a payload means is up to the target store.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::log::{ChainError, ExtractError, LogError, TransactionCursor, TxId, LOG_NAME_PREFIX};

pub mod file;
pub mod lock;
pub mod redo;
pub mod source;

pub use file::{directory_contains_store, FileStore, StoreMeta, META_FILE, RECORDS_FILE};
pub use lock::{DirLock, LOCK_FILE};
pub use redo::{RedoError, RedoOp, Records};
pub use source::LogSource;

/// How much checking a store does while it applies transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    /// Log each applied transaction.
    #[default]
    Logging,

    /// Log each applied transaction and read it back from the log.
    FullWithLogging,
}

/// Options a store is opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Keep every log segment on shutdown instead of pruning old ones.
    pub keep_logical_logs: bool,
    pub verification: VerificationLevel,
    pub log_prefix: String,
    pub log_rotation_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            keep_logical_logs: true,
            verification: VerificationLevel::Logging,
            log_prefix: LOG_NAME_PREFIX.to_owned(),
            log_rotation_threshold: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("target store already exists in {dir}")]
    AlreadyExists { dir: PathBuf },

    #[error("{dir} does not contain a store")]
    NotAStore { dir: PathBuf },

    #[error("{dir} is in use by another process")]
    Locked { dir: PathBuf },

    #[error("{dir} must be opened with logical logs kept to serve as a replay source")]
    LogsNotRetained { dir: PathBuf },

    #[error("unreadable store file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("recovery failed: {0}")]
    Recovery(#[from] ExtractError),

    #[error("recovery failed: {0}")]
    RecoveryApply(#[from] ApplyError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by a target while applying a committed transaction.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("transaction {found} out of order, store expects {expected}")]
    OutOfOrder { expected: TxId, found: TxId },

    #[error("malformed payload in transaction {tx_id}: {reason}")]
    MalformedPayload { tx_id: TxId, reason: String },

    #[error("transaction {tx_id} violates a store constraint: {source}")]
    Constraint {
        tx_id: TxId,
        #[source]
        source: RedoError,
    },

    #[error("transaction {tx_id} failed read-back verification: {source}")]
    Verification {
        tx_id: TxId,
        #[source]
        source: LogError,
    },

    #[error("transaction {tx_id} could not be logged: {source}")]
    Log {
        tx_id: TxId,
        #[source]
        source: LogError,
    },

    #[error("store is shut down")]
    Closed,
}

/// A store that accepts committed transactions for redo.
pub trait TransactionApply {
    /// Apply the committed transaction `tx_id`.
    ///
    /// Implementations must ignore an id they have already applied
    /// and reject any other id than the next one expected.
    fn apply_committed_transaction(&mut self, tx_id: TxId, payload: &[u8]) -> Result<(), ApplyError>;
}

/// A store opened to host log reading for a replay.
pub trait TransactionSource {
    type Cursor: TransactionCursor;

    /// Last transaction committed in the source when it was opened.
    fn last_committed_tx_id(&self) -> TxId;

    /// Cursor over the committed transactions `start..=end`.
    fn log_extractor(&self, start: TxId, end: TxId) -> Result<Self::Cursor, ExtractError>;

    /// Release the source. Calling it again is a no-op.
    fn shutdown(&mut self) -> Result<(), StoreError>;
}

/// Read access to a store's committed state, for consistency checking.
pub trait StoreAccess {
    fn directory(&self) -> &Path;

    fn log_prefix(&self) -> &str;

    fn records(&self) -> &Records;

    fn last_committed_tx_id(&self) -> TxId;
}
