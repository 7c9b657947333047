#![allow(dead_code)]

#[cfg(feature = "ssl")]
pub use openssl;

mod buf_ext;
pub mod cancel;
pub mod conn;
pub mod query;
mod stream;

pub use cancel::CancelHandle;
pub use conn::{Connection, ConnectionOptions};
pub use query::{Column, QueryResult, QueryResults, RowValue, SelectQueryResult};
