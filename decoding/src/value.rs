use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeSeq, Serializer};

/// Dynamically-typed field value decoded from a `test_decoding` line.
///
/// A sum type rather than `serde_json::Value` directly: `Bytes` carries raw
/// bytes (base64-encoded on the wire, matching the Go original's
/// `json.Marshal([]byte)` behavior) and `Timestamp` carries a parsed instant
/// rather than a string, so JSON-encoding lives here once instead of at
/// every call site that builds a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  I64(i64),
  F64(f64),
  Bytes(Vec<u8>),
  Text(String),
  Timestamp(DateTime<Utc>),
  Array(Vec<Value>),
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }
}

impl Serialize for Value {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    match self {
      Value::Null => serializer.serialize_none(),
      Value::Bool(b) => serializer.serialize_bool(*b),
      Value::I64(n) => serializer.serialize_i64(*n),
      Value::F64(n) => serializer.serialize_f64(*n),
      Value::Bytes(b) => serializer.serialize_str(&base64::encode(b)),
      Value::Text(s) => serializer.serialize_str(s),
      Value::Timestamp(t) => serializer.serialize_str(&t.to_rfc3339()),
      Value::Array(items) => {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
          seq.serialize_element(item)?;
        }
        seq.end()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn serializes_bytes_as_base64() {
    let v = Value::Bytes(vec![0x01, 0x02, 0xff]);
    assert_eq!(serde_json::to_string(&v).unwrap(), "\"AQL/\"");
  }

  #[test]
  fn serializes_array_recursively() {
    let v = Value::Array(vec![Value::I64(1), Value::I64(2), Value::Null]);
    assert_eq!(serde_json::to_string(&v).unwrap(), "[1,2,null]");
  }
}
