//! Parallel Transform Stage (C6): decouples decode throughput from publish
//! latency by fanning decoded [`CDCEvent`]s out to a worker pool that does
//! event-name lookup, before/after merge, and JSON encoding.
//!
//! Ordering across the stage is explicitly not preserved (spec.md §4.6);
//! the shared-receiver fan-out below is what drops it, which is fine
//! because the downstream contract is "idempotent by message-id".

use std::collections::BTreeMap;
use std::sync::Arc;

use decoding::Value;
use sink::{CDCEvent, Operation, Request};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::SourceTable;

pub const DEFAULT_BUFFER_SIZE: usize = 2_048;
pub const DEFAULT_WORKER_COUNT: usize = 16;

pub struct TransformStage {
  input: Option<mpsc::Sender<CDCEvent>>,
  output: mpsc::Receiver<Request>,
  workers: Vec<JoinHandle<()>>,
}

impl TransformStage {
  pub fn spawn(tables: Arc<std::collections::HashMap<String, SourceTable>>, worker_count: usize, buffer_size: usize) -> Self {
    let (input_tx, input_rx) = mpsc::channel(buffer_size);
    let (output_tx, output_rx) = mpsc::channel(buffer_size);
    let input_rx = Arc::new(Mutex::new(input_rx));

    let workers = (0..worker_count.max(1))
      .map(|_| {
        let input_rx = input_rx.clone();
        let output_tx = output_tx.clone();
        let tables = tables.clone();
        tokio::spawn(async move {
          loop {
            let event = {
              let mut rx = input_rx.lock().await;
              rx.recv().await
            };
            let Some(event) = event else { break };

            if let Some(request) = prepare_request(&tables, event) {
              if output_tx.send(request).await.is_err() {
                break;
              }
            }
          }
        })
      })
      .collect();

    Self {
      input: Some(input_tx),
      output: output_rx,
      workers,
    }
  }

  /// Pushes a decoded event into the stage. Returns `false` if the input
  /// side has been closed ([`Self::close_input`]) or every worker has
  /// exited.
  pub async fn push(&self, event: CDCEvent) -> bool {
    match &self.input {
      Some(input) => input.send(event).await.is_ok(),
      None => false,
    }
  }

  /// A cloneable handle to the stage's input side, for callers (e.g. the
  /// supervisor's event-receiver task) that need to feed events into the
  /// stage from a task that does not also own `recv`. Callers that take a
  /// clone here should [`Self::close_input`] the stage's own handle so the
  /// worker pool's channel closes as soon as every *external* handle is
  /// dropped, rather than staying open for the lifetime of whatever task
  /// ends up owning this `TransformStage` (e.g. one still awaiting
  /// [`Self::recv`] in a loop).
  pub fn sender(&self) -> mpsc::Sender<CDCEvent> {
    self.input.as_ref().expect("input already closed").clone()
  }

  /// Drops the stage's own input handle. Once every handle returned by
  /// [`Self::sender`] is also dropped, the worker pool's channel closes,
  /// every worker exits, and [`Self::recv`] resolves to `None` once it has
  /// drained.
  pub fn close_input(&mut self) {
    self.input = None;
  }

  /// Pulls the next transformed request. Resolves to `None` once the
  /// input side is closed and every worker has drained.
  pub async fn recv(&mut self) -> Option<Request> {
    self.output.recv().await
  }
}

/// Looks up the configured event name, merges `before`/`after` (after wins
/// on key collision), and JSON-encodes the payload. Returns `None` — and
/// logs once — for an unknown table, an operation with no configured event
/// name, or a JSON encode failure; all three are drop-with-warning per
/// spec.md §4.6/§7.
fn prepare_request(tables: &std::collections::HashMap<String, SourceTable>, event: CDCEvent) -> Option<Request> {
  let Some(table_cfg) = tables.get(&event.table) else {
    tracing::warn!(table = %event.table, "dropping event: unknown table");
    return None;
  };

  let event_name = match event.operation {
    Operation::Insert => &table_cfg.events.create,
    Operation::Update => &table_cfg.events.update,
    Operation::Delete => &table_cfg.events.delete,
    Operation::Snapshot => &table_cfg.events.snapshot,
  };

  if event_name.is_empty() {
    tracing::warn!(table = %event.table, operation = ?event.operation, "dropping event: no event name configured");
    return None;
  }

  let mut data: BTreeMap<String, Value> = event.before;
  data.extend(event.after);

  let payload = match serde_json::to_vec(&data) {
    Ok(payload) => payload,
    Err(err) => {
      tracing::warn!(table = %event.table, error = %err, "dropping event: JSON encode failed");
      return None;
    }
  };

  Some(Request {
    event_name: event_name.clone(),
    payload,
    lsn: event.lsn,
    table: event.table,
    time: event.time,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{SourceTable, SourceTableEvents};
  use std::collections::HashMap;

  fn tables_with_insert_event(table: &str, event_name: &str) -> Arc<HashMap<String, SourceTable>> {
    let mut tables = HashMap::new();
    tables.insert(
      table.to_string(),
      SourceTable {
        events: SourceTableEvents {
          snapshot: String::new(),
          create: event_name.to_string(),
          update: String::new(),
          delete: String::new(),
        },
      },
    );
    Arc::new(tables)
  }

  #[tokio::test]
  async fn transforms_insert_into_request() {
    let tables = tables_with_insert_event("public.users", "users.created");
    let mut stage = TransformStage::spawn(tables, 2, 16);

    let mut after = BTreeMap::new();
    after.insert("id".to_string(), Value::I64(7));
    stage
      .push(CDCEvent {
        operation: Operation::Insert,
        table: "public.users".to_string(),
        before: BTreeMap::new(),
        after,
        lsn: "0/1-501".to_string(),
        time: 0,
      })
      .await;

    let request = stage.recv().await.unwrap();
    assert_eq!(request.event_name, "users.created");
    assert_eq!(request.payload, br#"{"id":7}"#);
  }

  #[tokio::test]
  async fn drops_events_for_unknown_tables() {
    let tables = tables_with_insert_event("public.users", "users.created");
    let mut stage = TransformStage::spawn(tables, 2, 16);

    stage
      .push(CDCEvent {
        operation: Operation::Insert,
        table: "public.unknown".to_string(),
        before: BTreeMap::new(),
        after: BTreeMap::new(),
        lsn: "0/1-1".to_string(),
        time: 0,
      })
      .await;
    stage
      .push(CDCEvent {
        operation: Operation::Insert,
        table: "public.users".to_string(),
        before: BTreeMap::new(),
        after: BTreeMap::new(),
        lsn: "0/2-2".to_string(),
        time: 0,
      })
      .await;

    let request = stage.recv().await.unwrap();
    assert_eq!(request.lsn, "0/2-2");
  }

  #[tokio::test]
  async fn after_wins_over_before_on_key_collision() {
    let tables = tables_with_insert_event("public.users", "users.updated");
    let mut stage = TransformStage::spawn(tables, 1, 16);

    let mut before = BTreeMap::new();
    before.insert("v".to_string(), Value::I64(1));
    let mut after = BTreeMap::new();
    after.insert("v".to_string(), Value::I64(2));

    stage
      .push(CDCEvent {
        operation: Operation::Insert,
        table: "public.users".to_string(),
        before,
        after,
        lsn: "0/1-1".to_string(),
        time: 0,
      })
      .await;

    let request = stage.recv().await.unwrap();
    assert_eq!(request.payload, br#"{"v":2}"#);
  }
}
