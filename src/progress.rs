//! Progress Store Adapter (C5): a facade over a local key-value store
//! tracking per-table initial-load completion. Keys are
//! `"{source}-{table}"` (spec.md §9 Open Question (a): canonical over the
//! bare `"{table}"` form, to disambiguate multi-source deployments).

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProgressStoreError {
  #[error("sled error: {0}")]
  Sled(#[from] sled::Error),
}

/// `registerColumns`/`getInt64`/`putInt64` from spec.md §4.5, made a Rust
/// trait so the "store disabled" fallback ([`NullProgressStore`]) and the
/// real [`SledProgressStore`] share one call site in the reader.
pub trait ProgressStore: Send + Sync {
  fn register_columns(&self, names: &[&str]) -> Result<(), ProgressStoreError>;
  fn get_int64(&self, column: &str, key: &str) -> Result<i64, ProgressStoreError>;
  fn put_int64(&self, column: &str, key: &str, value: i64) -> Result<(), ProgressStoreError>;
  fn close(&self);
}

pub fn progress_key(source: &str, table: &str) -> String {
  format!("{source}-{table}")
}

/// Integer `>= 1` means loaded; `0` or absent means not loaded, per
/// spec.md §3's TableState encoding.
pub fn is_loaded(store: &dyn ProgressStore, source: &str, table: &str) -> Result<bool, ProgressStoreError> {
  Ok(store.get_int64("status", &progress_key(source, table))? >= 1)
}

pub fn mark_loaded(store: &dyn ProgressStore, source: &str, table: &str) -> Result<(), ProgressStoreError> {
  store.put_int64("status", &progress_key(source, table), 1)
}

pub struct SledProgressStore {
  db: sled::Db,
}

impl SledProgressStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ProgressStoreError> {
    Ok(Self { db: sled::open(path)? })
  }
}

impl ProgressStore for SledProgressStore {
  fn register_columns(&self, names: &[&str]) -> Result<(), ProgressStoreError> {
    for name in names {
      self.db.open_tree(name)?;
    }
    Ok(())
  }

  fn get_int64(&self, column: &str, key: &str) -> Result<i64, ProgressStoreError> {
    let tree = self.db.open_tree(column)?;
    let value = tree
      .get(key.as_bytes())?
      .and_then(|bytes| bytes.as_ref().try_into().ok())
      .map(i64::from_be_bytes)
      .unwrap_or(0);
    Ok(value)
  }

  fn put_int64(&self, column: &str, key: &str, value: i64) -> Result<(), ProgressStoreError> {
    let tree = self.db.open_tree(column)?;
    tree.insert(key.as_bytes(), &value.to_be_bytes())?;
    tree.flush()?;
    Ok(())
  }

  fn close(&self) {
    let _ = self.db.flush();
  }
}

/// The "store disabled" fallback: every table reports not-loaded, so
/// every restart re-snapshots (spec.md §4.5, §8).
#[derive(Debug, Default)]
pub struct NullProgressStore;

impl ProgressStore for NullProgressStore {
  fn register_columns(&self, _names: &[&str]) -> Result<(), ProgressStoreError> {
    Ok(())
  }

  fn get_int64(&self, _column: &str, _key: &str) -> Result<i64, ProgressStoreError> {
    Ok(0)
  }

  fn put_int64(&self, _column: &str, _key: &str, _value: i64) -> Result<(), ProgressStoreError> {
    Ok(())
  }

  fn close(&self) {}
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  struct TempDir(std::path::PathBuf);

  impl Drop for TempDir {
    fn drop(&mut self) {
      let _ = std::fs::remove_dir_all(&self.0);
    }
  }

  fn temp_dir() -> TempDir {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let mut path = std::env::temp_dir();
    path.push(format!("pg2bus-progress-test-{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::SeqCst)));
    TempDir(path)
  }

  #[test]
  fn null_store_never_reports_loaded() {
    let store = NullProgressStore;
    assert!(!is_loaded(&store, "src", "t").unwrap());
    mark_loaded(&store, "src", "t").unwrap();
    assert!(!is_loaded(&store, "src", "t").unwrap());
  }

  #[test]
  fn sled_store_persists_loaded_flag() {
    let dir = temp_dir();
    let store = SledProgressStore::open(&dir.0).unwrap();
    store.register_columns(&["status"]).unwrap();
    assert!(!is_loaded(&store, "orders_db", "public.orders").unwrap());
    mark_loaded(&store, "orders_db", "public.orders").unwrap();
    assert!(is_loaded(&store, "orders_db", "public.orders").unwrap());
    assert!(!is_loaded(&store, "orders_db", "public.other").unwrap());
  }

  #[test]
  fn progress_key_disambiguates_sources() {
    assert_eq!(progress_key("a", "t"), "a-t");
    assert_ne!(progress_key("a", "t"), progress_key("b", "t"));
  }
}
