//! Event builder (C3): turns a raw `pg_logical_slot_get_changes` row or a
//! snapshot cursor row into a [`sink::CDCEvent`].

use std::collections::BTreeMap;

use decoding::Value;
use sink::{CDCEvent, Operation};
use thiserror::Error;

/// One row returned by `SELECT * FROM pg_logical_slot_get_changes(...)`.
/// Older server versions name the LSN column `location` instead of `lsn`;
/// callers pass through whichever the row actually had.
#[derive(Debug, Clone)]
pub struct RawSlotRow {
  pub data: String,
  pub lsn_or_location: String,
  pub xid: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBuilderError {
  /// `BEGIN`/`COMMIT` or any other non-`table` directive. Not a failure —
  /// the reader silently skips it.
  #[error("transaction boundary or unsupported directive")]
  Skip,
  #[error("failed to decode row: {0}")]
  Parse(String),
}

impl From<decoding::ParseError> for EventBuilderError {
  fn from(err: decoding::ParseError) -> Self {
    EventBuilderError::Parse(err.to_string())
  }
}

/// Builds a CDCEvent from a replication-slot row, or returns
/// [`EventBuilderError::Skip`] for transaction boundaries.
pub fn from_decoded(row: RawSlotRow) -> Result<CDCEvent, EventBuilderError> {
  if !row.data.starts_with("table ") {
    return Err(EventBuilderError::Skip);
  }

  let record = decoding::parse_record(&row.data)?;
  let lsn = format!("{}-{}", row.lsn_or_location, row.xid);

  Ok(CDCEvent {
    operation: record.operation.into(),
    table: record.table,
    before: record.before,
    after: record.after,
    lsn,
    time: chrono::Utc::now().timestamp(),
  })
}

/// Builds a Snapshot CDCEvent for one row returned by the initial-load
/// cursor. `batch_index`/`row_index` are both 1-based, matching the
/// pattern `"{source}-{table}-{batch}-{row}"` spec.md §4.3 requires.
pub fn from_snapshot_row(
  source: &str,
  table: &str,
  after: BTreeMap<String, Value>,
  batch_index: usize,
  row_index: usize,
) -> CDCEvent {
  CDCEvent {
    operation: Operation::Snapshot,
    table: table.to_string(),
    before: BTreeMap::new(),
    after,
    lsn: format!("{source}-{table}-{batch_index}-{row_index}"),
    time: chrono::Utc::now().timestamp(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn insert_line_produces_insert_event() {
    let row = RawSlotRow {
      data: "table public.users: INSERT: id[integer]:7 name[character varying]:'bob'".to_string(),
      lsn_or_location: "0/1A2B3C".to_string(),
      xid: "501".to_string(),
    };
    let event = from_decoded(row).unwrap();
    assert_eq!(event.operation, Operation::Insert);
    assert_eq!(event.table, "public.users");
    assert!(event.before.is_empty());
    assert_eq!(event.after["id"], Value::I64(7));
    assert_eq!(event.lsn, "0/1A2B3C-501");
  }

  #[test]
  fn begin_and_commit_are_skipped() {
    for line in ["BEGIN 501", "COMMIT 501"] {
      let row = RawSlotRow {
        data: line.to_string(),
        lsn_or_location: "0/1A2B3C".to_string(),
        xid: "501".to_string(),
      };
      assert_eq!(from_decoded(row), Err(EventBuilderError::Skip));
    }
  }

  #[test]
  fn snapshot_lsn_matches_source_table_batch_row_pattern() {
    let event = from_snapshot_row("orders_db", "public.orders", BTreeMap::new(), 3, 42);
    assert_eq!(event.lsn, "orders_db-public.orders-3-42");
    assert_eq!(event.operation, Operation::Snapshot);
  }

  #[test]
  fn malformed_row_is_a_parse_error_not_a_panic() {
    let row = RawSlotRow {
      data: "table t: TRUNCATE: v[integer]:1".to_string(),
      lsn_or_location: "0/0".to_string(),
      xid: "1".to_string(),
    };
    assert!(matches!(from_decoded(row), Err(EventBuilderError::Parse(_))));
  }
}
