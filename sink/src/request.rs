//! The Request value described in spec.md §3: derived from a [`crate::CDCEvent`]
//! by the transform stage (C6) and consumed by the publisher (C7).

#[derive(Debug, Clone)]
pub struct Request {
  pub event_name: String,
  pub payload: Vec<u8>,
  pub lsn: String,
  pub table: String,
  pub time: i64,
}

impl Request {
  pub fn blank() -> Self {
    Self {
      event_name: String::new(),
      payload: Vec::new(),
      lsn: String::new(),
      table: String::new(),
      time: 0,
    }
  }

  /// `"{source}-{table}-{lsn}"`, unique per logical change within a source
  /// and used verbatim as the downstream `Nats-Msg-Id` header.
  pub fn message_id(&self, source: &str) -> String {
    format!("{source}-{}-{}", self.table, self.lsn)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_id_is_stable_for_identical_lsn() {
    let mut req = Request::blank();
    req.table = "public.users".to_string();
    req.lsn = "0/1A2B3C-501".to_string();
    assert_eq!(req.message_id("src"), "src-public.users-0/1A2B3C-501");
    assert_eq!(req.message_id("src"), req.message_id("src"));
  }
}
