// Redo Operations
//
// Payload format understood by the file-backed store: a JSON array of
// key/value operations. A transaction is staged against the current
// records first and only committed once every operation is valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Committed key/value state of a store.
pub type Records = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RedoOp {
    Put { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedoError {
    #[error("empty record key")]
    EmptyKey,

    #[error("record {0:?} is not in use")]
    NotInUse(String),
}

pub fn encode_redo(ops: &[RedoOp]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(ops)
}

pub fn decode_redo(payload: &[u8]) -> Result<Vec<RedoOp>, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Net effect of one transaction: `None` removes the key.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StagedChanges {
    changes: BTreeMap<String, Option<String>>,
}

impl StagedChanges {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Validate `ops` in order against `records` without touching them.
pub fn stage(records: &Records, ops: &[RedoOp]) -> Result<StagedChanges, RedoError> {
    let mut staged = StagedChanges::default();

    for op in ops {
        match op {
            RedoOp::Put { key, value } => {
                if key.is_empty() {
                    return Err(RedoError::EmptyKey);
                }
                staged.changes.insert(key.clone(), Some(value.clone()));
            }
            RedoOp::Delete { key } => {
                let in_use = match staged.changes.get(key) {
                    Some(pending) => pending.is_some(),
                    None => records.contains_key(key),
                };
                if !in_use {
                    return Err(RedoError::NotInUse(key.clone()));
                }
                staged.changes.insert(key.clone(), None);
            }
        }
    }

    Ok(staged)
}

pub fn commit(records: &mut Records, staged: StagedChanges) {
    for (key, value) in staged.changes {
        match value {
            Some(value) => {
                records.insert(key, value);
            }
            None => {
                records.remove(&key);
            }
        }
    }
}

/// Stage and commit in one step.
pub fn apply(records: &mut Records, ops: &[RedoOp]) -> Result<(), RedoError> {
    let staged = stage(records, ops)?;
    commit(records, staged);
    Ok(())
}
