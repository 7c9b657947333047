//! Black-box grammar coverage against the public API, one level up from the
//! inline unit tests in `src/parser.rs`: full records as they'd arrive over
//! the wire, checked the way a downstream payload encoder would consume them.

use decoding::{parse_record, Operation, Value};

#[test]
fn full_insert_record_encodes_to_expected_json_payload() {
  let record = parse_record("table public.users: INSERT: id[integer]:7 name[character varying]:'bob'").unwrap();

  assert_eq!(record.table, "public.users");
  assert_eq!(record.operation, Operation::Insert);
  assert!(record.before.is_empty());

  let payload = serde_json::to_string(&record.after).unwrap();
  assert_eq!(payload, r#"{"id":7,"name":"bob"}"#);
}

#[test]
fn begin_and_commit_are_not_table_records() {
  assert!(!"BEGIN 123".starts_with("table "));
  assert!(!"COMMIT 123".starts_with("table "));
}

#[test]
fn mixed_record_with_array_bytea_and_null_decodes_each_field_independently() {
  let record = parse_record(
    r#"table public.events: INSERT: tags[text[]]:'{"a","b"}' payload[bytea]:'\x0102ff' note[text]:null"#,
  )
  .unwrap();

  assert_eq!(
    record.after["tags"],
    Value::Array(vec![Value::Text("a".to_string()), Value::Text("b".to_string())])
  );
  assert_eq!(record.after["payload"], Value::Bytes(vec![0x01, 0x02, 0xff]));
  assert_eq!(record.after["note"], Value::Null);
}

#[test]
fn replica_identity_full_delete_has_no_after_fields() {
  let record = parse_record("table t: DELETE: old-key: id[integer]:1 v[integer]:9").unwrap();
  assert_eq!(record.operation, Operation::Delete);
  assert!(record.after.is_empty());
  assert_eq!(record.before["v"], Value::I64(9));
}
