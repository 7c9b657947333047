//! Tokenizer for the `test_decoding` logical-decoding output line grammar.
//!
//! Operates on a read-only string cursor: [`next_token`] takes the
//! remaining input and returns the next token plus whatever is left.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
  OpenParen,
  CloseParen,
  Comma,
  Colon,
  Atom(&'a str),
  String(&'a str),
  Number(&'a str),
  Operator(&'a str),
  LineComment(&'a str),
  BlockComment(&'a str),
  Bracket(&'a str),
  End,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LexError {
  #[error("unterminated quoted string")]
  UnterminatedString,
  #[error("unterminated block comment")]
  UnterminatedComment,
  #[error("missing ']:' terminator for bracketed field type")]
  UnterminatedBracket,
  #[error("unexpected character {0:?}")]
  UnexpectedChar(char),
}

/// Returns the next token and the remainder of `input` after it.
pub fn next_token(input: &str) -> Result<(Token<'_>, &str), LexError> {
  let input = input.trim_start();

  if input.is_empty() {
    return Ok((Token::End, input));
  }

  if let Some(rest) = input.strip_prefix("table ") {
    let word_len = rest.find(|c: char| c.is_whitespace() || c == ':').unwrap_or(rest.len());
    let (word, rest) = rest.split_at(word_len);
    return Ok((Token::String(word), rest));
  }

  if let Some(rest) = input.strip_prefix("--") {
    let len = rest.find('\n').unwrap_or(rest.len());
    let (comment, rest) = rest.split_at(len);
    return Ok((Token::LineComment(comment), rest));
  }

  if let Some(rest) = input.strip_prefix("/*") {
    return match rest.find("*/") {
      Some(len) => {
        let (comment, rest) = rest.split_at(len);
        Ok((Token::BlockComment(comment), &rest[2..]))
      }
      None => Err(LexError::UnterminatedComment),
    };
  }

  if let Some(rest) = input.strip_prefix("||") {
    return Ok((Token::Operator("||"), rest));
  }

  if let Some(rest) = input.strip_prefix(":=") {
    return Ok((Token::Operator(":="), rest));
  }

  let c = input.chars().next().expect("input is non-empty");

  match c {
    '[' => {
      let rest = &input[1..];
      match rest.find("]:") {
        Some(len) => {
          let (name, rest) = rest.split_at(len);
          Ok((Token::Bracket(name), &rest[2..]))
        }
        None => Err(LexError::UnterminatedBracket),
      }
    }
    '(' => Ok((Token::OpenParen, &input[1..])),
    ')' => Ok((Token::CloseParen, &input[1..])),
    ',' => Ok((Token::Comma, &input[1..])),
    ':' => Ok((Token::Colon, &input[1..])),
    ';' => Ok((Token::Operator(";"), &input[1..])),
    '\'' => scan_quoted_string(&input[1..]),
    '-' | '+' | '=' | '*' | '<' | '>' | '/' => Ok((Token::Operator(&input[..1]), &input[1..])),
    c if c.is_ascii_digit() => scan_number(input),
    '_' | '.' | '"' => scan_atom(input),
    c if c.is_ascii_alphabetic() => scan_atom(input),
    c => Err(LexError::UnexpectedChar(c)),
  }
}

/// `rest` starts right after the opening quote. `''` is the only escape the
/// lexer itself understands; it only affects where the string ends. The
/// slice returned is the raw, un-unescaped content between the quotes —
/// callers run it through [`crate::unescape::unescape`] once.
fn scan_quoted_string(rest: &str) -> Result<(Token<'_>, &str), LexError> {
  let bytes = rest.as_bytes();
  let mut i = 0;
  loop {
    match bytes.get(i) {
      None => return Err(LexError::UnterminatedString),
      Some(b'\'') => {
        if bytes.get(i + 1) == Some(&b'\'') {
          i += 2;
        } else {
          let (content, tail) = rest.split_at(i);
          return Ok((Token::String(content), &tail[1..]));
        }
      }
      Some(_) => i += 1,
    }
  }
}

fn scan_number(input: &str) -> Result<(Token<'_>, &str), LexError> {
  let mut len = 0;
  let mut seen_dot = false;
  for ch in input.chars() {
    if ch.is_ascii_digit() {
      len += ch.len_utf8();
    } else if ch == '.' && !seen_dot {
      seen_dot = true;
      len += ch.len_utf8();
    } else {
      break;
    }
  }
  let (number, rest) = input.split_at(len);
  Ok((Token::Number(number), rest))
}

fn scan_atom(input: &str) -> Result<(Token<'_>, &str), LexError> {
  let mut len = 0;
  for ch in input.chars() {
    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '"' {
      len += ch.len_utf8();
    } else {
      break;
    }
  }
  let (atom, rest) = input.split_at(len);
  Ok((Token::Atom(atom), rest))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lexes_table_prefix() {
    let (tok, rest) = next_token("table public.users: INSERT: id[integer]:1").unwrap();
    assert_eq!(tok, Token::String("public.users"));
    assert_eq!(rest, ": INSERT: id[integer]:1");
  }

  #[test]
  fn lexes_bracketed_type() {
    let (tok, rest) = next_token("[integer]:7").unwrap();
    assert_eq!(tok, Token::Bracket("integer"));
    assert_eq!(rest, "7");
  }

  #[test]
  fn lexes_quoted_string_with_escape() {
    let (tok, rest) = next_token("'aaa''aaa' rest").unwrap();
    assert_eq!(tok, Token::String("aaa''aaa"));
    assert_eq!(rest, " rest");
  }

  #[test]
  fn unterminated_string_is_an_error() {
    assert_eq!(next_token("'aaa"), Err(LexError::UnterminatedString));
  }

  #[test]
  fn lexes_number_and_atom() {
    assert_eq!(next_token("123.5,").unwrap().0, Token::Number("123.5"));
    assert_eq!(next_token("true ").unwrap().0, Token::Atom("true"));
  }

  #[test]
  fn lexes_negative_number_as_operator_then_number() {
    let (op, rest) = next_token("-7").unwrap();
    assert_eq!(op, Token::Operator("-"));
    assert_eq!(next_token(rest).unwrap().0, Token::Number("7"));
  }

  #[test]
  fn end_of_input() {
    assert_eq!(next_token("   ").unwrap().0, Token::End);
  }
}
