// Consistency Checking
//
// Structural checks over a store after a rebuild. Findings are
// reported, never raised: a report with findings still means the
// rebuild itself completed.

use crate::log::{
    last_tx_id, segment_range, LogExtractor, TransactionCursor, TxBuffer, BOOTSTRAP_TX_ID,
    FIRST_REPLAYED_TX_ID,
};
use crate::store::redo::{self, decode_redo, Records};
use crate::store::StoreAccess;

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The check could not cover everything.
    Warning,

    /// Store contents are inconsistent.
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindingKind {
    InvalidRecord,
    LogUnreadable,
    HistoryIncomplete,
    TxIdMismatch,
    RecordMismatch,
    MissingRecord,
    UnexpectedRecord,
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    fn new(kind: FindingKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
        }
    }
}

/// Full check report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub findings: Vec<Finding>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    /// Operator-facing summary, one finding per line.
    pub fn summary(&self) -> String {
        if self.is_clean() {
            return "consistency check found no problems".to_owned();
        }

        let mut out = format!("consistency check reported {} finding(s):", self.findings.len());
        for finding in &self.findings {
            out.push_str(&format!("\n  [{:?}] {}", finding.severity, finding.message));
        }
        out
    }
}

/// A structural verifier run against a store after replay.
pub trait ConsistencyCheck<A: StoreAccess + ?Sized> {
    fn verify(&self, store: &A, full: bool) -> CheckReport;
}

/// Checks a store's records against its own transaction log.
///
/// The quick pass looks at record keys and the log tail. The full pass
/// also re-derives every record by replaying the log from the first
/// transaction after bootstrap.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordChecker;

impl<A: StoreAccess + ?Sized> ConsistencyCheck<A> for RecordChecker {
    fn verify(&self, store: &A, full: bool) -> CheckReport {
        let mut findings = Vec::new();

        if store.records().contains_key("") {
            findings.push(Finding::new(
                FindingKind::InvalidRecord,
                Severity::Critical,
                "record with an empty key",
            ));
        }

        let dir = store.directory();
        let prefix = store.log_prefix();
        let segments = match segment_range(dir, prefix) {
            Ok(Some(segments)) => segments,
            Ok(None) => {
                findings.push(Finding::new(
                    FindingKind::HistoryIncomplete,
                    Severity::Warning,
                    "store has no transaction log",
                ));
                return CheckReport { findings };
            }
            Err(e) => {
                findings.push(Finding::new(FindingKind::LogUnreadable, Severity::Critical, e.to_string()));
                return CheckReport { findings };
            }
        };

        match last_tx_id(dir, prefix, segments.clone()) {
            Ok(logged) => {
                let logged = logged.unwrap_or(BOOTSTRAP_TX_ID);
                if logged != store.last_committed_tx_id() {
                    findings.push(Finding::new(
                        FindingKind::TxIdMismatch,
                        Severity::Critical,
                        format!(
                            "log ends at transaction {logged}, store reports {}",
                            store.last_committed_tx_id()
                        ),
                    ));
                }
            }
            Err(e) => {
                findings.push(Finding::new(FindingKind::LogUnreadable, Severity::Critical, e.to_string()));
                return CheckReport { findings };
            }
        }

        if !full {
            return CheckReport { findings };
        }

        if *segments.start() != 0 {
            findings.push(Finding::new(
                FindingKind::HistoryIncomplete,
                Severity::Warning,
                format!(
                    "log starts at segment {}, records cannot be re-derived",
                    segments.start()
                ),
            ));
            return CheckReport { findings };
        }

        let mut extractor = LogExtractor::new(
            dir,
            prefix,
            segments,
            FIRST_REPLAYED_TX_ID,
            store.last_committed_tx_id(),
        );
        match rederive(&mut extractor) {
            Ok(expected) => compare_records(&expected, store.records(), &mut findings),
            Err(message) => findings.push(Finding::new(
                FindingKind::LogUnreadable,
                Severity::Critical,
                message,
            )),
        }

        CheckReport { findings }
    }
}

fn rederive(extractor: &mut LogExtractor) -> Result<Records, String> {
    let mut records = Records::new();
    let mut buffer = TxBuffer::new();

    while let Some(tx_id) = extractor.extract_next(&mut buffer).map_err(|e| e.to_string())? {
        let ops = decode_redo(buffer.as_bytes())
            .map_err(|e| format!("transaction {tx_id} cannot be decoded: {e}"))?;
        redo::apply(&mut records, &ops)
            .map_err(|e| format!("transaction {tx_id} cannot be replayed: {e}"))?;
    }

    Ok(records)
}

fn compare_records(expected: &Records, actual: &Records, findings: &mut Vec<Finding>) {
    for (key, value) in expected {
        match actual.get(key) {
            None => findings.push(Finding::new(
                FindingKind::MissingRecord,
                Severity::Critical,
                format!("record {key:?} is missing"),
            )),
            Some(stored) if stored != value => findings.push(Finding::new(
                FindingKind::RecordMismatch,
                Severity::Critical,
                format!("record {key:?} holds {stored:?}, log says {value:?}"),
            )),
            Some(_) => {}
        }
    }

    for key in actual.keys().filter(|key| !expected.contains_key(*key)) {
        findings.push(Finding::new(
            FindingKind::UnexpectedRecord,
            Severity::Critical,
            format!("record {key:?} is not backed by the log"),
        ));
    }
}
