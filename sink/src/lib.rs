//! CDCEvent/Request model and the [`Publisher`] trait (C7) with its stdout
//! and NATS JetStream implementations.

pub mod event;
pub mod publisher;
pub mod request;

pub use event::{CDCEvent, Operation};
pub use publisher::{AckFuture, NatsPublisher, PublishError, Publisher, StdoutPublisher};
pub use request::Request;
