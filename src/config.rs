//! Source configuration file and global configuration document (spec.md §6).
//!
//! Mirrors the original's `viper`-backed loader with `serde_json` instead:
//! one JSON document holds both the per-source `sources.*` map and the
//! global `store.*`/`gravity.*` keys.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::crypto::{self, CryptoError};

const DEFAULT_INITIAL_LOAD_BATCH_SIZE: u32 = 100_000;
const DEFAULT_PUBLISH_BATCH_SIZE: usize = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read { path: String, source: std::io::Error },
  #[error("failed to parse config file {path}: {source}")]
  Parse { path: String, source: serde_json::Error },
  #[error("source {source_name:?} is missing required field {field}")]
  MissingField { source_name: String, field: &'static str },
  #[error("failed to decrypt {env_var} override: {source}")]
  PasswordDecrypt { env_var: String, source: CryptoError },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceTableEvents {
  pub snapshot: String,
  pub create: String,
  pub update: String,
  pub delete: String,
}

impl Default for SourceTableEvents {
  fn default() -> Self {
    Self {
      snapshot: String::new(),
      create: String::new(),
      update: String::new(),
      delete: String::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceTable {
  pub events: SourceTableEvents,
}

fn default_interval() -> u64 {
  5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
  #[serde(default)]
  pub disabled: bool,
  #[serde(default)]
  pub initial_load: bool,
  #[serde(default)]
  pub initial_load_batch_size: u32,
  pub host: String,
  #[serde(default = "default_pg_port")]
  pub port: u16,
  pub username: String,
  #[serde(default)]
  pub password: String,
  pub dbname: String,
  #[serde(default)]
  pub param: String,
  pub slot_name: String,
  #[serde(default = "default_interval")]
  pub interval: u64,
  #[serde(default)]
  pub tables: HashMap<String, SourceTable>,
}

fn default_pg_port() -> u16 {
  5432
}

impl SourceInfo {
  /// `0` in the config means "use the default" (the original's
  /// `viper.SetDefault` semantics).
  pub fn initial_load_batch_size(&self) -> u32 {
    if self.initial_load_batch_size == 0 {
      DEFAULT_INITIAL_LOAD_BATCH_SIZE
    } else {
      self.initial_load_batch_size
    }
  }

  fn validate(&self, name: &str) -> Result<(), ConfigError> {
    if self.host.is_empty() {
      return Err(ConfigError::MissingField { source_name: name.to_string(), field: "host" });
    }
    if self.dbname.is_empty() {
      return Err(ConfigError::MissingField { source_name: name.to_string(), field: "dbname" });
    }
    if self.slot_name.is_empty() {
      return Err(ConfigError::MissingField { source_name: name.to_string(), field: "slotName" });
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub enabled: bool,
  pub path: String,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self { enabled: false, path: "./store".to_string() }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GravityConfig {
  pub host: String,
  pub port: u16,
  pub domain: String,
  pub ping_interval: u64,
  pub max_pings_outstanding: u32,
  pub max_reconnects: i32,
  pub access_token: String,
  pub publish_batch_size: usize,
}

impl Default for GravityConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 4222,
      domain: String::new(),
      ping_interval: 120,
      max_pings_outstanding: 2,
      max_reconnects: -1,
      access_token: String::new(),
      publish_batch_size: DEFAULT_PUBLISH_BATCH_SIZE,
    }
  }
}

impl GravityConfig {
  pub fn publish_batch_size(&self) -> usize {
    if self.publish_batch_size == 0 {
      DEFAULT_PUBLISH_BATCH_SIZE
    } else {
      self.publish_batch_size
    }
  }

  pub fn url(&self) -> String {
    format!("nats://{}:{}", self.host, self.port)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Document {
  pub sources: HashMap<String, SourceInfo>,
  pub store: StoreConfig,
  pub gravity: GravityConfig,
}

impl Default for Document {
  fn default() -> Self {
    Self {
      sources: HashMap::new(),
      store: StoreConfig::default(),
      gravity: GravityConfig::default(),
    }
  }
}

/// Loads and validates the configuration document, applying the
/// `<NAME>_PASSWORD` environment override (decrypted via [`crypto`]) over
/// whatever `password` the JSON document carries. Disabled sources are
/// kept in the returned map (callers skip them at supervisor spawn time)
/// so `Uninit` can still enumerate every configured source name, matching
/// the original's `SourceManager.Uninit`.
pub fn load(path: impl AsRef<Path>) -> Result<Document, ConfigError> {
  let path = path.as_ref();
  let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.display().to_string(),
    source,
  })?;

  let mut document: Document = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
    path: path.display().to_string(),
    source,
  })?;

  for (name, info) in document.sources.iter_mut() {
    if info.disabled {
      continue;
    }

    info.validate(name)?;

    let env_var = format!("{}_PASSWORD", name.to_uppercase());
    if let Ok(encrypted) = std::env::var(&env_var) {
      if !encrypted.is_empty() {
        info.password = crypto::decrypt_password(&encrypted).map_err(|source| ConfigError::PasswordDecrypt { env_var, source })?;
      }
    }
  }

  Ok(document)
}

#[cfg(test)]
mod tests {
  use std::io::Write;
  use std::path::PathBuf;
  use std::sync::atomic::{AtomicU32, Ordering};

  use super::*;

  struct TempPath(PathBuf);

  impl AsRef<Path> for TempPath {
    fn as_ref(&self) -> &Path {
      &self.0
    }
  }

  impl Drop for TempPath {
    fn drop(&mut self) {
      let _ = std::fs::remove_file(&self.0);
    }
  }

  fn write_temp_config(contents: &str) -> TempPath {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let mut path = std::env::temp_dir();
    path.push(format!(
      "pg2bus-config-test-{}-{}.json",
      std::process::id(),
      COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::File::create(&path).unwrap().write_all(contents.as_bytes()).unwrap();
    TempPath(path)
  }

  #[test]
  fn loads_minimal_source_with_defaults() {
    let path = write_temp_config(
      r#"{
        "sources": {
          "orders_db": {
            "host": "localhost",
            "username": "postgres",
            "dbname": "orders",
            "slotName": "orders_slot",
            "tables": {}
          }
        }
      }"#,
    );

    let doc = load(&path).unwrap();
    let info = &doc.sources["orders_db"];
    assert_eq!(info.port, 5432);
    assert_eq!(info.initial_load_batch_size(), DEFAULT_INITIAL_LOAD_BATCH_SIZE);
    assert_eq!(info.interval, 5);
    assert!(!doc.store.enabled);
  }

  #[test]
  fn disabled_source_skips_validation() {
    let path = write_temp_config(
      r#"{"sources": {"broken": {"disabled": true, "host": "", "username": "", "dbname": "", "slotName": ""}}}"#,
    );
    let doc = load(&path).unwrap();
    assert!(doc.sources["broken"].disabled);
  }

  #[test]
  fn missing_required_field_is_an_error() {
    let path = write_temp_config(r#"{"sources": {"broken": {"host": "", "username": "u", "dbname": "d", "slotName": "s"}}}"#);
    assert!(matches!(load(&path), Err(ConfigError::MissingField { .. })));
  }
}
