use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{AckFuture, PublishError, Publisher};

/// Logs instead of publishing, for tests and `--dry-run`. Every publish
/// resolves immediately, so ack reconciliation is always a no-op against it.
#[derive(Debug, Default)]
pub struct StdoutPublisher;

#[async_trait]
impl Publisher for StdoutPublisher {
  async fn publish_async(
    &self,
    subject: &str,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
  ) -> Result<AckFuture, PublishError> {
    tracing::info!(subject, payload = %String::from_utf8_lossy(&payload), ?headers, "publish");
    Ok(Box::pin(async { Ok(()) }))
  }

  async fn publish_msg(&self, subject: &str, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<(), PublishError> {
    self.publish_async(subject, payload, headers).await?.await
  }

  async fn publish_async_complete(&self, _timeout: Duration) -> bool {
    true
  }

  fn publish_async_pending(&self) -> usize {
    0
  }

  async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn publish_resolves_immediately() {
    let publisher = StdoutPublisher;
    let ack = publisher
      .publish_async("subject", b"{}".to_vec(), HashMap::new())
      .await
      .unwrap();
    ack.await.unwrap();
    assert!(publisher.publish_async_complete(Duration::from_secs(0)).await);
  }
}
