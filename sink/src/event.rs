//! The CDCEvent value described in spec.md §3: a per-row change record
//! produced by the event builder (C3) and consumed by the transform stage
//! (C6).

use std::collections::BTreeMap;

use decoding::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Snapshot,
  Insert,
  Update,
  Delete,
}

impl From<decoding::Operation> for Operation {
  fn from(op: decoding::Operation) -> Self {
    match op {
      decoding::Operation::Insert => Operation::Insert,
      decoding::Operation::Update => Operation::Update,
      decoding::Operation::Delete => Operation::Delete,
    }
  }
}

/// `before` is empty except potentially for updates/deletes; `after` is
/// empty for pure deletes; for a snapshot row it mirrors the row.
#[derive(Debug, Clone)]
pub struct CDCEvent {
  pub operation: Operation,
  pub table: String,
  pub before: BTreeMap<String, Value>,
  pub after: BTreeMap<String, Value>,
  pub lsn: String,
  pub time: i64,
}

