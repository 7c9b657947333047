//! Publisher (C7): async publish with a bounded in-flight window and
//! batch-ack reconciliation (spec.md §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sink::{AckFuture, Publisher, Request};

const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const SUBMIT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

pub const NATS_MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Owns the in-flight window for one source and runs the reconciliation
/// algorithm described in spec.md §4.7: submit with retry, accumulate ack
/// futures, and every `batch_size`th publish wait on them in order up to a
/// per-future deadline — on the first timeout, abandon further waits,
/// reset the publisher's in-flight state, and resynchronously republish
/// every request from that index onward.
pub struct PublishCoordinator {
  publisher: Arc<dyn Publisher>,
  source: String,
  batch_size: usize,
  in_flight: Vec<(Request, AckFuture)>,
  counter: AtomicU64,
}

impl PublishCoordinator {
  pub fn new(publisher: Arc<dyn Publisher>, source: String, batch_size: usize) -> Self {
    Self {
      publisher,
      source,
      batch_size: batch_size.max(1),
      in_flight: Vec::new(),
      counter: AtomicU64::new(0),
    }
  }

  fn headers_for(&self, request: &Request) -> HashMap<String, String> {
    let mut headers = HashMap::with_capacity(1);
    headers.insert(NATS_MSG_ID_HEADER.to_string(), request.message_id(&self.source));
    headers
  }

  /// Submits `request`, retrying the submit call on a 1s backoff until
  /// accepted into the in-flight set. Triggers reconciliation once every
  /// `batch_size` publishes.
  pub async fn publish(&mut self, request: Request) {
    let headers = self.headers_for(&request);

    let ack = loop {
      match self
        .publisher
        .publish_async(&request.event_name, request.payload.clone(), headers.clone())
        .await
      {
        Ok(ack) => break ack,
        Err(err) => {
          tracing::warn!(error = %err, subject = %request.event_name, "publish-submit failed, retrying in 1s");
          tokio::time::sleep(SUBMIT_RETRY_BACKOFF).await;
        }
      }
    };

    self.in_flight.push((request, ack));
    let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;

    if count as usize % self.batch_size == 0 {
      self.reconcile().await;
    }
  }

  /// Waits on every outstanding ack in order; on the first timeout,
  /// abandons the rest and resynchronously republishes from there.
  async fn reconcile(&mut self) {
    let batch = std::mem::take(&mut self.in_flight);
    let mut requests = Vec::with_capacity(batch.len());
    let mut first_failed = None;

    for (index, (request, ack)) in batch.into_iter().enumerate() {
      if first_failed.is_none() {
        match tokio::time::timeout(ACK_TIMEOUT, ack).await {
          Ok(Ok(())) => {}
          Ok(Err(err)) => {
            tracing::warn!(index, error = %err, "ack failed, forcing resynchronous republish from here");
            first_failed = Some(index);
          }
          Err(_elapsed) => {
            tracing::warn!(index, "ack wait timed out after 30s, forcing resynchronous republish from here");
            first_failed = Some(index);
          }
        }
      }
      requests.push(request);
    }

    if let Some(from) = first_failed {
      self.publisher.cleanup().await;
      for request in &requests[from..] {
        self.republish_blocking(request).await;
      }
    }
  }

  async fn republish_blocking(&self, request: &Request) {
    let headers = self.headers_for(request);
    loop {
      match self
        .publisher
        .publish_msg(&request.event_name, request.payload.clone(), headers.clone())
        .await
      {
        Ok(()) => break,
        Err(err) => {
          tracing::warn!(error = %err, subject = %request.event_name, "resynchronous republish failed, retrying in 1s");
          tokio::time::sleep(SUBMIT_RETRY_BACKOFF).await;
        }
      }
    }
  }

  /// Drains whatever is still in flight (spawning each held ack future so
  /// it keeps resolving even though we stop polling it directly here),
  /// then blocks up to 60s on the publisher's own completion signal.
  pub async fn drain_on_shutdown(&mut self) {
    for (_, ack) in self.in_flight.drain(..) {
      tokio::spawn(ack);
    }

    if !self.publisher.publish_async_complete(SHUTDOWN_DRAIN_TIMEOUT).await {
      tracing::warn!(
        pending = self.publisher.publish_async_pending(),
        "shutdown ack-drain timed out after 60s, proceeding to close"
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex;

  /// Fails the ack for every `fail_at` call (by submission order) and
  /// succeeds immediately for everything else, so tests can force a
  /// timeout at a specific offset without waiting out the real 30s clock
  /// (use with `#[tokio::test(start_paused = true)]`).
  #[derive(Default)]
  struct FlakyPublisher {
    fail_at: Vec<usize>,
    submitted: AtomicUsize,
    resynced: Mutex<Vec<String>>,
    cleanups: AtomicUsize,
  }

  #[async_trait]
  impl Publisher for FlakyPublisher {
    async fn publish_async(
      &self,
      _subject: &str,
      _payload: Vec<u8>,
      headers: HashMap<String, String>,
    ) -> Result<AckFuture, sink::PublishError> {
      let index = self.submitted.fetch_add(1, Ordering::SeqCst);
      let fail = self.fail_at.contains(&index);
      Ok(Box::pin(async move {
        if fail {
          tokio::time::sleep(Duration::from_secs(3600)).await; // never resolves before the 30s deadline
        }
        let _ = headers;
        Ok(())
      }))
    }

    async fn publish_msg(&self, _subject: &str, _payload: Vec<u8>, headers: HashMap<String, String>) -> Result<(), sink::PublishError> {
      self.resynced.lock().unwrap().push(headers[NATS_MSG_ID_HEADER].clone());
      Ok(())
    }

    async fn publish_async_complete(&self, _timeout: Duration) -> bool {
      true
    }

    fn publish_async_pending(&self) -> usize {
      0
    }

    async fn cleanup(&self) {
      self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn request(table: &str, lsn: &str) -> Request {
    Request {
      event_name: "subj".to_string(),
      payload: b"{}".to_vec(),
      lsn: lsn.to_string(),
      table: table.to_string(),
      time: 0,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn reconciles_full_batch_without_failures() {
    let publisher = Arc::new(FlakyPublisher::default());
    let mut coordinator = PublishCoordinator::new(publisher.clone(), "src".to_string(), 4);

    for i in 0..4 {
      coordinator.publish(request("t", &i.to_string())).await;
    }

    assert_eq!(publisher.cleanups.load(Ordering::SeqCst), 0);
    assert!(publisher.resynced.lock().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn ack_timeout_triggers_cleanup_and_resync_from_failure_index() {
    let publisher = Arc::new(FlakyPublisher {
      fail_at: vec![2],
      ..Default::default()
    });
    let mut coordinator = PublishCoordinator::new(publisher.clone(), "src".to_string(), 5);

    for i in 0..5 {
      coordinator.publish(request("t", &i.to_string())).await;
    }

    assert_eq!(publisher.cleanups.load(Ordering::SeqCst), 1);
    let resynced = publisher.resynced.lock().unwrap();
    assert_eq!(resynced.as_slice(), ["src-t-2", "src-t-3", "src-t-4"]);
  }
}
