use bytes::Buf;
use std::{collections::BTreeMap, io};

pub trait BufExt: Buf {
  fn pg_get_null_terminated_string(&mut self) -> io::Result<String> {
    match self.chunk().iter().position(|x| *x == 0x00) {
      Some(len) => {
        let mut buffer = vec![0; len];
        self.copy_to_slice(buffer.as_mut_slice());
        self.advance(1);

        String::from_utf8(buffer).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
      }
      None => Err(io::Error::new(io::ErrorKind::InvalidData, "missing null terminator")),
    }
  }

  fn pg_get_fixed_length_string(&mut self, len: usize) -> io::Result<String> {
    if self.remaining() < len {
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated field value"));
    }
    let mut bytes = vec![0; len];
    self.copy_to_slice(bytes.as_mut_slice());
    String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
  }

  fn pg_get_fields(&mut self) -> io::Result<BTreeMap<char, String>> {
    let mut fields = BTreeMap::new();
    loop {
      if !self.has_remaining() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated field list"));
      }
      match self.get_u8() {
        0 => break,
        token => {
          let msg = self.pg_get_null_terminated_string()?;
          fields.insert(char::from(token), msg);
        }
      }
    }
    Ok(fields)
  }

  fn pg_get_backend_error(&mut self) -> io::Error {
    // https://www.postgresql.org/docs/11/protocol-error-fields.html
    // ErrorResponse (B)
    //     Byte1('E')
    //     Int32 length
    //     One or more identified fields, terminated by a zero byte.
    //     Byte1 field code, String value.
    match self.pg_get_fields() {
      Ok(fields) if fields.contains_key(&'C') && fields.contains_key(&'M') => io::Error::new(
        io::ErrorKind::Other,
        format!("Server error {}: {}", fields[&'C'], fields[&'M']),
      ),
      Ok(_) => io::Error::new(io::ErrorKind::InvalidData, "missing error fields from server"),
      Err(err) => err,
    }
  }

  fn pg_get_backend_notice(&mut self) -> io::Error {
    // Same wire shape as ErrorResponse but severity NOTICE/WARNING/etc; see NoticeResponse (B).
    match self.pg_get_fields() {
      Ok(fields) if fields.contains_key(&'C') && fields.contains_key(&'M') => io::Error::new(
        io::ErrorKind::Other,
        format!("Server notice {}: {}", fields[&'C'], fields[&'M']),
      ),
      Ok(_) => io::Error::new(io::ErrorKind::InvalidData, "missing notice fields from server"),
      Err(err) => err,
    }
  }
}

impl<T> BufExt for T where T: Buf {}
