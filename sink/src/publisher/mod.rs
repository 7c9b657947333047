//! The Publisher trait (C7): §6's "inject a publisher exposing
//! `publishAsync`/`publishMsg`/`publishAsyncComplete`/`publishAsyncPending`/
//! `cleanupPublisher`" contract, made concrete.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

mod nats;
mod stdout;

pub use nats::NatsPublisher;
pub use stdout::StdoutPublisher;

#[derive(Debug, Error)]
pub enum PublishError {
  #[error("transient publish error: {0}")]
  Transient(String),
  #[error("ack wait timed out")]
  Timeout,
}

/// Resolves once the message the submitting call produced has been
/// acknowledged (or has definitively failed). Boxed so the trait stays
/// object-safe across the two publisher implementations.
pub type AckFuture = BoxFuture<'static, Result<(), PublishError>>;

#[async_trait]
pub trait Publisher: Send + Sync {
  /// Submits `payload` for async publish, returning the not-yet-resolved
  /// ack future. Implementations return `Err` only for transient
  /// submission failures (e.g. connection down) — the caller (C7) retries
  /// the same request on a 1s backoff until this returns `Ok`.
  async fn publish_async(
    &self,
    subject: &str,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
  ) -> Result<AckFuture, PublishError>;

  /// Blocking (from the caller's perspective) publish used for
  /// resynchronous retries during batch reconciliation.
  async fn publish_msg(&self, subject: &str, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<(), PublishError>;

  /// Blocks up to `timeout` for every outstanding async publish to
  /// resolve. Returns whether the drain completed before the deadline.
  async fn publish_async_complete(&self, timeout: Duration) -> bool;

  /// Number of async publishes submitted but not yet resolved.
  fn publish_async_pending(&self) -> usize;

  /// Resets the publisher's internal in-flight bookkeeping after a forced
  /// ack-timeout recovery (§4.7 step 3). A no-op for publishers with no
  /// such state to reset.
  async fn cleanup(&self);
}
