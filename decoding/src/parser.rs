//! Field parser (C2): turns `table X: OP: f[type]:value ...` lines into a
//! typed field map, per the grammar in the module-level docs.
//!
//! ```text
//! record   := 'table ' qname ':' opname ':' field*
//! field    := name '[' type ']' ':' value
//! value    := 'null' | literal | quoted | array
//! array    := "'" '{' elem (',' elem)* '}' "'"
//! elem     := quoted-dq | bare | array
//! ```

use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeZone, Utc};

use crate::lexer::{next_token, LexError, Token};
use crate::unescape::unescape;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Insert,
  Update,
  Delete,
}

#[derive(Debug, Clone)]
pub struct ParsedRecord {
  pub table: String,
  pub operation: Operation,
  pub before: BTreeMap<String, Value>,
  pub after: BTreeMap<String, Value>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
  #[error("lex error: {0}")]
  Lex(#[from] LexError),
  #[error("expected {expected}, found {found:?}")]
  UnexpectedToken { expected: &'static str, found: String },
  #[error("unknown operation {0:?}")]
  UnknownOperation(String),
  #[error("malformed array literal: {0}")]
  MalformedArray(String),
  #[error("invalid {type_name} value {raw:?}: {reason}")]
  InvalidValue {
    type_name: String,
    raw: String,
    reason: String,
  },
}

/// Parses one `table ...` line into a [`ParsedRecord`]. Callers (the event
/// builder) are responsible for recognizing non-`table` lines (`BEGIN`,
/// `COMMIT`) before reaching here; this function only knows the grammar
/// above.
pub fn parse_record(line: &str) -> Result<ParsedRecord, ParseError> {
  let (tok, rest) = next_token(line)?;
  let table = expect_string(tok, "table name")?.to_string();

  let (tok, rest) = next_token(rest)?;
  expect_colon(tok)?;

  let (tok, rest) = next_token(rest)?;
  let opname = expect_atom(tok, "operation")?;
  let operation = match opname {
    "INSERT" => Operation::Insert,
    "UPDATE" => Operation::Update,
    "DELETE" => Operation::Delete,
    other => return Err(ParseError::UnknownOperation(other.to_string())),
  };

  let (tok, mut rest) = next_token(rest)?;
  expect_colon(tok)?;

  let mut before = BTreeMap::new();
  let mut after = BTreeMap::new();

  // Optional `old-key: field*` / `new-tuple: field*` sections, emitted only
  // under REPLICA IDENTITY FULL. Absent them, fields map to `after` for
  // INSERT/UPDATE and to `before` for DELETE (the only image test_decoding
  // gives us for a deleted row).
  loop {
    let (peeked, peeked_rest) = next_token(rest)?;
    match peeked {
      Token::Atom("old-key") => {
        let (colon, r) = next_token(peeked_rest)?;
        expect_colon(colon)?;
        rest = parse_fields(r, &mut before)?;
      }
      Token::Atom("new-tuple") => {
        let (colon, r) = next_token(peeked_rest)?;
        expect_colon(colon)?;
        rest = parse_fields(r, &mut after)?;
      }
      Token::End => break,
      _ => {
        let target = match operation {
          Operation::Delete => &mut before,
          Operation::Insert | Operation::Update => &mut after,
        };
        rest = parse_fields(rest, target)?;
        break;
      }
    }
  }

  Ok(ParsedRecord {
    table,
    operation,
    before,
    after,
  })
}

/// Parses zero or more `field` productions starting at `input`, stopping at
/// `old-key`/`new-tuple` section markers or end of input.
fn parse_fields<'a>(mut input: &'a str, out: &mut BTreeMap<String, Value>) -> Result<&'a str, ParseError> {
  loop {
    let (tok, rest) = next_token(input)?;
    match tok {
      Token::End | Token::Atom("old-key") | Token::Atom("new-tuple") => return Ok(input),
      Token::Atom(name) => {
        let (bracket, rest) = next_token(rest)?;
        let type_name = expect_bracket(bracket)?;
        let (value, rest) = parse_value(type_name, rest)?;
        out.insert(name.to_string(), value);
        input = rest;
      }
      other => {
        return Err(ParseError::UnexpectedToken {
          expected: "field name",
          found: format!("{:?}", other),
        })
      }
    }
  }
}

fn parse_value<'a>(type_name: &str, input: &'a str) -> Result<(Value, &'a str), ParseError> {
  let (tok, rest) = next_token(input)?;

  if let Token::Atom("null") = tok {
    return Ok((Value::Null, rest));
  }

  if type_name.ends_with("[]") {
    let element_type = &type_name[..type_name.len() - 2];
    let raw = expect_string(tok, "array literal")?;
    return Ok((parse_array(element_type, raw)?, rest));
  }

  match type_name {
    "boolean" => match tok {
      Token::Atom("true") => Ok((Value::Bool(true), rest)),
      Token::Atom("false") => Ok((Value::Bool(false), rest)),
      other => unexpected("boolean literal", other),
    },
    "smallint" | "integer" | "bigint" => {
      let (digits, rest) = read_signed_literal(tok, rest)?;
      parse_i64(type_name, digits).map(|v| (v, rest))
    }
    "real" | "numeric" | "double precision" => {
      let (digits, rest) = read_signed_literal(tok, rest)?;
      parse_f64(type_name, digits).map(|v| (v, rest))
    }
    "bytea" => {
      let raw = unescape(expect_string(tok, "bytea literal")?);
      parse_bytea(raw).map(|v| (v, rest))
    }
    "money" => {
      let raw = unescape(expect_string(tok, "money literal")?);
      parse_money(raw).map(|v| (v, rest))
    }
    "timestamp without time zone" => {
      let raw = unescape(expect_string(tok, "timestamp literal")?);
      parse_timestamp(raw).map(|v| (v, rest))
    }
    "date" => {
      let raw = unescape(expect_string(tok, "date literal")?);
      parse_date(raw).map(|v| (v, rest))
    }
    "time without time zone" | "interval" => {
      let raw = unescape(expect_string(tok, "passthrough literal")?);
      Ok((Value::Text(raw), rest))
    }
    "bit" | "bit varying" => {
      let prefix = expect_atom(tok, "bit prefix")?;
      if prefix != "B" {
        return unexpected("'B' bit prefix", tok);
      }
      let (str_tok, rest) = next_token(rest)?;
      let raw = unescape(expect_string(str_tok, "bit literal")?);
      Ok((Value::Text(raw), rest))
    }
    _ => Ok((passthrough(tok)?, rest)),
  }
}

/// Numeric literals may be preceded by a standalone `-` operator token,
/// since the lexer tokenizes sign and digits separately.
fn read_signed_literal<'a>(tok: Token<'a>, rest: &'a str) -> Result<(String, &'a str), ParseError> {
  match tok {
    Token::Operator("-") => {
      let (digits, rest) = next_token(rest)?;
      let digits = expect_number(digits)?;
      Ok((format!("-{digits}"), rest))
    }
    Token::Number(n) => Ok((n.to_string(), rest)),
    other => unexpected("numeric literal", other).map(|_: Value| unreachable!()),
  }
}

fn passthrough(tok: Token<'_>) -> Result<Value, ParseError> {
  match tok {
    Token::String(raw) => Ok(Value::Text(unescape(raw))),
    Token::Atom(raw) => Ok(Value::Text(raw.to_string())),
    Token::Number(raw) => Ok(Value::Text(raw.to_string())),
    other => unexpected("passthrough value", other),
  }
}

fn parse_i64(type_name: &str, raw: String) -> Result<Value, ParseError> {
  raw.parse::<i64>().map(Value::I64).map_err(|err| ParseError::InvalidValue {
    type_name: type_name.to_string(),
    raw,
    reason: err.to_string(),
  })
}

fn parse_f64(type_name: &str, raw: String) -> Result<Value, ParseError> {
  raw.parse::<f64>().map(Value::F64).map_err(|err| ParseError::InvalidValue {
    type_name: type_name.to_string(),
    raw,
    reason: err.to_string(),
  })
}

fn parse_bytea(raw: String) -> Result<Value, ParseError> {
  let hex = raw.strip_prefix("\\x").ok_or_else(|| ParseError::InvalidValue {
    type_name: "bytea".to_string(),
    raw: raw.clone(),
    reason: "missing \\x prefix".to_string(),
  })?;
  decode_hex(hex).map(Value::Bytes).map_err(|reason| ParseError::InvalidValue {
    type_name: "bytea".to_string(),
    raw,
    reason,
  })
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
  if hex.len() % 2 != 0 {
    return Err("odd number of hex digits".to_string());
  }
  (0..hex.len())
    .step_by(2)
    .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|err| err.to_string()))
    .collect()
}

fn parse_money(raw: String) -> Result<Value, ParseError> {
  let stripped = raw.strip_prefix('$').unwrap_or(&raw).replace(',', "");
  stripped.parse::<f64>().map(Value::F64).map_err(|err| ParseError::InvalidValue {
    type_name: "money".to_string(),
    raw,
    reason: err.to_string(),
  })
}

fn parse_timestamp(raw: String) -> Result<Value, ParseError> {
  let rfc3339 = format!("{}Z", raw.replacen(' ', "T", 1));
  chrono::DateTime::parse_from_rfc3339(&rfc3339)
    .map(|dt| Value::Timestamp(dt.with_timezone(&Utc)))
    .map_err(|err| ParseError::InvalidValue {
      type_name: "timestamp without time zone".to_string(),
      raw,
      reason: err.to_string(),
    })
}

fn parse_date(raw: String) -> Result<Value, ParseError> {
  NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
    .map(|d| Value::Timestamp(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight is valid"))))
    .map_err(|err| ParseError::InvalidValue {
      type_name: "date".to_string(),
      raw,
      reason: err.to_string(),
    })
}

/// `raw` is the content between the outer single quotes of an array
/// literal, e.g. `{1,2,3}` or `{"a","b"}`, possibly nested.
fn parse_array(element_type: &str, raw: &str) -> Result<Value, ParseError> {
  let inner = raw
    .strip_prefix('{')
    .and_then(|s| s.strip_suffix('}'))
    .ok_or_else(|| ParseError::MalformedArray(raw.to_string()))?;

  if inner.is_empty() {
    return Ok(Value::Array(Vec::new()));
  }

  split_top_level(inner)
    .into_iter()
    .map(|elem| decode_array_element(element_type, elem))
    .collect::<Result<Vec<_>, _>>()
    .map(Value::Array)
}

fn decode_array_element(element_type: &str, elem: &str) -> Result<Value, ParseError> {
  let elem = elem.trim();

  if elem.eq_ignore_ascii_case("null") {
    return Ok(Value::Null);
  }

  if let Some(inner) = elem.strip_prefix('{') {
    if inner.ends_with('}') {
      return parse_array(element_type, elem);
    }
  }

  if let Some(quoted) = elem.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
    return decode_scalar(element_type, unescape(quoted));
  }

  decode_scalar(element_type, unescape(elem))
}

/// Type dispatch shared between array elements and (indirectly, via
/// [`parse_value`]) scalar fields, operating on an already-unescaped raw
/// string rather than a token.
fn decode_scalar(type_name: &str, raw: String) -> Result<Value, ParseError> {
  match type_name {
    "boolean" => match raw.as_str() {
      "true" | "t" => Ok(Value::Bool(true)),
      "false" | "f" => Ok(Value::Bool(false)),
      _ => Err(ParseError::InvalidValue {
        type_name: type_name.to_string(),
        raw,
        reason: "not a boolean literal".to_string(),
      }),
    },
    "smallint" | "integer" | "bigint" => parse_i64(type_name, raw),
    "real" | "numeric" | "double precision" => parse_f64(type_name, raw),
    "bytea" => parse_bytea(raw),
    "money" => parse_money(raw),
    "timestamp without time zone" => parse_timestamp(raw),
    "date" => parse_date(raw),
    "time without time zone" | "interval" => Ok(Value::Text(raw)),
    "bit" | "bit varying" => Ok(Value::Text(raw.trim_start_matches('B').to_string())),
    _ => Ok(Value::Text(raw)),
  }
}

/// Splits array-literal content on top-level commas, respecting `"..."`
/// quoting, `{...}` nesting, and `\`-escaped characters (which are always
/// ASCII, so byte-indexing stays on char boundaries).
fn split_top_level(content: &str) -> Vec<&str> {
  let bytes = content.as_bytes();
  let mut parts = Vec::new();
  let mut depth = 0i32;
  let mut in_quotes = false;
  let mut start = 0;
  let mut i = 0;

  while i < bytes.len() {
    match bytes[i] {
      b'\\' => {
        i += 2;
        continue;
      }
      b'"' => in_quotes = !in_quotes,
      b'{' if !in_quotes => depth += 1,
      b'}' if !in_quotes => depth -= 1,
      b',' if !in_quotes && depth == 0 => {
        parts.push(&content[start..i]);
        start = i + 1;
      }
      _ => {}
    }
    i += 1;
  }
  parts.push(&content[start..]);
  parts
}

fn expect_string<'a>(tok: Token<'a>, expected: &'static str) -> Result<&'a str, ParseError> {
  match tok {
    Token::String(s) => Ok(s),
    other => Err(ParseError::UnexpectedToken {
      expected,
      found: format!("{:?}", other),
    }),
  }
}

fn expect_atom<'a>(tok: Token<'a>, expected: &'static str) -> Result<&'a str, ParseError> {
  match tok {
    Token::Atom(s) => Ok(s),
    other => Err(ParseError::UnexpectedToken {
      expected,
      found: format!("{:?}", other),
    }),
  }
}

fn expect_bracket<'a>(tok: Token<'a>) -> Result<&'a str, ParseError> {
  match tok {
    Token::Bracket(s) => Ok(s),
    other => Err(ParseError::UnexpectedToken {
      expected: "bracketed field type",
      found: format!("{:?}", other),
    }),
  }
}

fn expect_number(tok: Token<'_>) -> Result<&str, ParseError> {
  match tok {
    Token::Number(s) => Ok(s),
    other => Err(ParseError::UnexpectedToken {
      expected: "number",
      found: format!("{:?}", other),
    }),
  }
}

fn expect_colon(tok: Token<'_>) -> Result<(), ParseError> {
  match tok {
    Token::Colon => Ok(()),
    other => Err(ParseError::UnexpectedToken {
      expected: "':'",
      found: format!("{:?}", other),
    }),
  }
}

fn unexpected<'a>(expected: &'static str, tok: Token<'a>) -> Result<Value, ParseError> {
  Err(ParseError::UnexpectedToken {
    expected,
    found: format!("{:?}", tok),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn after(line: &str) -> BTreeMap<String, Value> {
    parse_record(line).unwrap().after
  }

  #[test]
  fn parses_simple_insert() {
    let record = parse_record("table public.users: INSERT: id[integer]:7 name[character varying]:'bob'").unwrap();
    assert_eq!(record.table, "public.users");
    assert_eq!(record.operation, Operation::Insert);
    assert!(record.before.is_empty());
    assert_eq!(record.after["id"], Value::I64(7));
    assert_eq!(record.after["name"], Value::Text("bob".to_string()));
  }

  #[test]
  fn delete_fields_land_in_before() {
    let record = parse_record("table public.users: DELETE: id[integer]:1").unwrap();
    assert_eq!(record.operation, Operation::Delete);
    assert!(record.after.is_empty());
    assert_eq!(record.before["id"], Value::I64(1));
  }

  #[test]
  fn replica_identity_full_update_splits_before_and_after() {
    let record = parse_record(
      "table t: UPDATE: old-key: id[integer]:1 v[integer]:2 new-tuple: id[integer]:1 v[integer]:3",
    )
    .unwrap();
    assert_eq!(record.before["v"], Value::I64(2));
    assert_eq!(record.after["v"], Value::I64(3));
  }

  #[test]
  fn null_literal_wins_over_declared_type() {
    assert_eq!(after("table t: INSERT: v[integer]:null")["v"], Value::Null);
  }

  #[test]
  fn single_quote_escape_round_trips() {
    assert_eq!(
      after("table t: INSERT: v[text]:'aaa''aaa'")["v"],
      Value::Text("aaa'aaa".to_string())
    );
  }

  #[test]
  fn integer_array_decodes() {
    assert_eq!(
      after("table t: INSERT: v[integer[]]:'{1,2,3}'")["v"],
      Value::Array(vec![Value::I64(1), Value::I64(2), Value::I64(3)])
    );
  }

  #[test]
  fn nested_array_decodes() {
    let v = &after("table t: INSERT: v[integer[]]:'{{1,2},{3,4}}'")["v"];
    assert_eq!(
      *v,
      Value::Array(vec![
        Value::Array(vec![Value::I64(1), Value::I64(2)]),
        Value::Array(vec![Value::I64(3), Value::I64(4)]),
      ])
    );
  }

  #[test]
  fn string_array_with_dq_escapes() {
    let v = &after(r#"table t: INSERT: v[text[]]:'{"a\"b","c\,d"}'"#)["v"];
    assert_eq!(
      *v,
      Value::Array(vec![Value::Text("a\"b".to_string()), Value::Text("c,d".to_string())])
    );
  }

  #[test]
  fn unknown_type_passes_through_as_string() {
    assert_eq!(
      after("table t: INSERT: v[point]:'(1,2)'")["v"],
      Value::Text("(1,2)".to_string())
    );
  }

  #[test]
  fn bytea_decodes_hex() {
    assert_eq!(
      after(r"table t: INSERT: v[bytea]:'\x0102ff'")["v"],
      Value::Bytes(vec![0x01, 0x02, 0xff])
    );
  }

  #[test]
  fn bit_strips_b_prefix() {
    assert_eq!(after("table t: INSERT: v[bit]:B'0101'")["v"], Value::Text("0101".to_string()));
  }

  #[test]
  fn unknown_operation_is_an_error() {
    assert!(matches!(
      parse_record("table t: TRUNCATE: v[integer]:1"),
      Err(ParseError::UnknownOperation(_))
    ));
  }
}
