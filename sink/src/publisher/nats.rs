use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use async_nats::jetstream;

use super::{AckFuture, PublishError, Publisher};

/// Wraps an `async-nats` JetStream context. JetStream's `PublishAckFuture`
/// is the Rust-ecosystem equivalent of the Go SDK's ack future returned by
/// `PublishAsync`: awaiting it resolves once the server has durably
/// accepted the message.
pub struct NatsPublisher {
  jetstream: jetstream::Context,
  pending: Arc<AtomicUsize>,
}

impl NatsPublisher {
  pub fn new(client: async_nats::Client) -> Self {
    Self {
      jetstream: jetstream::new(client),
      pending: Arc::new(AtomicUsize::new(0)),
    }
  }

  fn header_map(headers: HashMap<String, String>) -> async_nats::HeaderMap {
    let mut out = async_nats::HeaderMap::new();
    for (k, v) in headers {
      out.insert(k.as_str(), v.as_str());
    }
    out
  }
}

#[async_trait]
impl Publisher for NatsPublisher {
  async fn publish_async(
    &self,
    subject: &str,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
  ) -> Result<AckFuture, PublishError> {
    let ack = self
      .jetstream
      .publish_with_headers(subject.to_string(), Self::header_map(headers), payload.into())
      .await
      .map_err(|err| PublishError::Transient(err.to_string()))?;

    self.pending.fetch_add(1, Ordering::SeqCst);
    let pending = self.pending.clone();

    Ok(Box::pin(async move {
      let result = ack.await.map(|_ack| ()).map_err(|_err| PublishError::Timeout);
      pending.fetch_sub(1, Ordering::SeqCst);
      result
    }))
  }

  async fn publish_msg(&self, subject: &str, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<(), PublishError> {
    self
      .jetstream
      .publish_with_headers(subject.to_string(), Self::header_map(headers), payload.into())
      .await
      .map_err(|err| PublishError::Transient(err.to_string()))?
      .await
      .map(|_ack| ())
      .map_err(|_err| PublishError::Timeout)
  }

  async fn publish_async_complete(&self, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while self.pending.load(Ordering::SeqCst) > 0 {
      if tokio::time::Instant::now() >= deadline {
        return false;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    true
  }

  fn publish_async_pending(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }

  async fn cleanup(&self) {
    // async-nats has no explicit "reset in-flight" call; the outstanding
    // PublishAckFutures we already handed out simply get dropped by the
    // caller. Zeroing our own counter keeps publish_async_pending honest.
    self.pending.store(0, Ordering::SeqCst);
  }
}
