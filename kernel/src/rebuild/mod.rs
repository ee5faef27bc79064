// Rebuild From Logs
//
// Creates a new store from the transaction log of another one:
// validate the segment chain, extract every committed transaction
// in id order and apply it exactly once to the new store.
//
// Phases: chain check -> source opened -> target created -> drained
// -> source shut down -> optional full check -> target shut down.
// The source and target are shut down on every exit path.

use std::path::Path;

use crate::check::{CheckReport, ConsistencyCheck, RecordChecker};
use crate::config::{ConfigError, RebuildConfig};
use crate::log::{
    find_max_log_id, ChainError, ExtractError, TransactionCursor, TxBuffer, TxId,
    FIRST_REPLAYED_TX_ID,
};
use crate::store::{
    directory_contains_store, ApplyError, FileStore, LogSource, StoreAccess, StoreError,
    TransactionApply, TransactionSource,
};

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("{0}")]
    InvalidArguments(String),

    #[error(transparent)]
    IncompleteLogChain(#[from] ChainError),

    #[error("extracting transactions failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("applying transaction failed: {0}")]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RebuildError {
    /// Whether the operator should be shown usage text.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            RebuildError::InvalidArguments(_) | RebuildError::IncompleteLogChain(_)
        )
    }
}

/// State of the target path before a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPath {
    Absent,

    /// A directory without a store in it. Accepted with a warning.
    ExistingDirectory,
}

/// Reject source and target paths a rebuild cannot use.
pub fn check_paths(source: &Path, target: &Path) -> Result<TargetPath, RebuildError> {
    if !source.is_dir() {
        return Err(RebuildError::InvalidArguments(format!(
            "{} is not a directory",
            source.display()
        )));
    }

    if directory_contains_store(target) {
        return Err(RebuildError::InvalidArguments(format!(
            "target store at {} already exists",
            target.display()
        )));
    }

    if target.is_dir() {
        if same_directory(source, target) {
            return Err(RebuildError::InvalidArguments(format!(
                "target {} is the source directory",
                target.display()
            )));
        }
        return Ok(TargetPath::ExistingDirectory);
    }

    if target.exists() {
        return Err(RebuildError::InvalidArguments(format!(
            "{} is a file",
            target.display()
        )));
    }

    Ok(TargetPath::Absent)
}

fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Counters for one replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub transactions_applied: u64,
    pub bytes_applied: u64,
    pub first_tx_id: Option<TxId>,
    pub last_tx_id: Option<TxId>,
}

/// Drives committed transactions from a source into a target store.
pub struct RebuildFromLogs<'a, T: TransactionApply> {
    target: &'a mut T,
}

impl<'a, T: TransactionApply> RebuildFromLogs<'a, T> {
    pub fn new(target: &'a mut T) -> Self {
        Self { target }
    }

    /// Replay every transaction the source committed after bootstrap.
    ///
    /// The source is shut down before this returns, whether or not
    /// the replay succeeded. A replay error takes precedence over a
    /// shutdown error.
    pub fn apply_transactions_from<S: TransactionSource>(
        &mut self,
        mut source: S,
    ) -> Result<ReplayStats, RebuildError> {
        let replayed = self.drain(&source);
        let shutdown = source.shutdown();

        match (replayed, shutdown) {
            (Ok(stats), Ok(())) => Ok(stats),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(shutdown_err)) => {
                tracing::warn!(error = %shutdown_err, "source shutdown failed after aborted replay");
                Err(e)
            }
        }
    }

    fn drain<S: TransactionSource>(&mut self, source: &S) -> Result<ReplayStats, RebuildError> {
        let end = source.last_committed_tx_id();
        let mut cursor = source.log_extractor(FIRST_REPLAYED_TX_ID, end)?;
        let mut buffer = TxBuffer::new();
        let mut stats = ReplayStats::default();

        loop {
            buffer.reset();
            let Some(tx_id) = cursor.extract_next(&mut buffer)? else {
                break;
            };

            self.apply_transaction(tx_id, buffer.as_bytes())?;

            stats.transactions_applied += 1;
            stats.bytes_applied += buffer.len() as u64;
            stats.first_tx_id.get_or_insert(tx_id);
            stats.last_tx_id = Some(tx_id);
        }

        tracing::info!(
            applied = stats.transactions_applied,
            last = ?stats.last_tx_id,
            "replay drained"
        );
        Ok(stats)
    }

    pub fn apply_transaction(&mut self, tx_id: TxId, payload: &[u8]) -> Result<(), ApplyError> {
        self.target.apply_committed_transaction(tx_id, payload)
    }
}

impl<T: TransactionApply + StoreAccess> RebuildFromLogs<'_, T> {
    /// Run `checker` over the target in full mode.
    pub fn full_check<C: ConsistencyCheck<T>>(&self, checker: &C) -> CheckReport {
        let report = checker.verify(&*self.target, true);
        if !report.is_clean() {
            tracing::warn!(findings = report.findings.len(), "consistency check reported findings");
        }
        report
    }
}

#[derive(Debug, Clone, Default)]
pub struct RebuildOptions {
    /// Read back every applied transaction and check the store afterwards.
    pub full: bool,
    pub config: RebuildConfig,
}

#[derive(Debug, Clone)]
pub struct RebuildSummary {
    pub source_segments: u64,
    pub stats: ReplayStats,

    /// Present only when a full check was requested.
    pub report: Option<CheckReport>,
}

/// Rebuild a store at `target` from the logs in `source`.
pub fn rebuild(
    source: &Path,
    target: &Path,
    options: &RebuildOptions,
) -> Result<RebuildSummary, RebuildError> {
    options.config.validate()?;

    if check_paths(source, target)? == TargetPath::ExistingDirectory {
        tracing::info!(dir = %target.display(), "rebuilding into existing directory");
    }

    // The chain is checked from the directory listing alone, before the
    // source is opened; nothing is created until the source is open.
    let max_segment = find_max_log_id(source, &options.config.log_prefix)?;
    let mut log_source = open_source(source, &options.config)?;

    let target_config = options.config.target_store_config(options.full);
    let mut store = match FileStore::create(target, target_config) {
        Ok(store) => store,
        Err(e) => {
            if let Err(shutdown_err) = log_source.shutdown() {
                tracing::warn!(error = %shutdown_err, "source shutdown failed");
            }
            return Err(e.into());
        }
    };

    let replayed = replay_into(&mut store, log_source, options.full);
    let shutdown = store.shutdown();

    let (stats, report) = match (replayed, shutdown) {
        (Ok(outcome), Ok(())) => outcome,
        (Ok(_), Err(e)) => return Err(e.into()),
        (Err(e), Ok(())) => return Err(e),
        (Err(e), Err(shutdown_err)) => {
            tracing::warn!(error = %shutdown_err, "target shutdown failed after aborted rebuild");
            return Err(e);
        }
    };

    Ok(RebuildSummary {
        source_segments: max_segment + 1,
        stats,
        report,
    })
}

fn open_source(source: &Path, config: &RebuildConfig) -> Result<LogSource, RebuildError> {
    LogSource::open(source, &config.source_store_config()).map_err(|e| match e {
        StoreError::Chain(chain) => RebuildError::IncompleteLogChain(chain),
        other => RebuildError::Store(other),
    })
}

fn replay_into(
    store: &mut FileStore,
    log_source: LogSource,
    full: bool,
) -> Result<(ReplayStats, Option<CheckReport>), RebuildError> {
    let mut rebuild = RebuildFromLogs::new(store);
    let stats = rebuild.apply_transactions_from(log_source)?;
    let report = full.then(|| rebuild.full_check(&RecordChecker));

    Ok((stats, report))
}
