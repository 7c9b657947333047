//! AES-CBC/PKCS7 decryption for the `<NAME>_PASSWORD` environment-variable
//! override (spec.md §6). The original encrypts with a 32-byte compile-time
//! key passed straight to `aes.NewCipher`, which in Go selects the cipher by
//! key length — a 32-byte key means AES-256, not AES-128 despite how the
//! env var is described in prose. We match the original's actual behavior
//! (see DESIGN.md) rather than the prose: AES-256-CBC, not AES-128-CBC.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use thiserror::Error;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Placeholder compile-time key, same role as the original's redacted
/// 32-byte constant. Operators who need real password-at-rest protection
/// must rebuild with their own key.
const KEY: [u8; 32] = *b"pg2bus-adapter-demo-key-32bytes!";

#[derive(Debug, Error)]
pub enum CryptoError {
  #[error("ciphertext is not valid hex: {0}")]
  InvalidHex(#[from] hex::FromHexError),
  #[error("ciphertext length is not a multiple of the AES block size")]
  BadLength,
  #[error("AES-CBC/PKCS7 decryption failed")]
  Decrypt,
  #[error("decrypted password is not valid UTF-8")]
  InvalidUtf8,
}

/// Decrypts a hex-encoded AES-256-CBC/PKCS7 ciphertext using [`KEY`] as both
/// key and IV source (the IV is the key's first block, matching the
/// original's `key[:blockSize]`).
pub fn decrypt_password(ciphertext_hex: &str) -> Result<String, CryptoError> {
  let mut buf = hex::decode(ciphertext_hex)?;
  if buf.is_empty() || buf.len() % 16 != 0 {
    return Err(CryptoError::BadLength);
  }

  let iv = &KEY[..16];
  let plaintext = Aes256CbcDec::new(&KEY.into(), iv.into())
    .decrypt_padded_mut::<Pkcs7>(&mut buf)
    .map_err(|_| CryptoError::Decrypt)?;

  String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
  use super::*;
  use aes::cipher::{BlockEncryptMut, KeyIvInit as _};

  type Aes256CbcEnc = cbc::Encryptor<Aes256>;

  fn encrypt_password(plaintext: &str) -> String {
    let iv = &KEY[..16];
    let enc = Aes256CbcEnc::new(&KEY.into(), iv.into());
    let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    hex::encode(ciphertext)
  }

  #[test]
  fn round_trips_through_encrypt_decrypt() {
    let encrypted = encrypt_password("hunter2");
    assert_eq!(decrypt_password(&encrypted).unwrap(), "hunter2");
  }

  #[test]
  fn rejects_non_hex_input() {
    assert!(matches!(decrypt_password("not hex!!"), Err(CryptoError::InvalidHex(_))));
  }

  #[test]
  fn rejects_truncated_ciphertext() {
    assert!(matches!(decrypt_password("aa"), Err(CryptoError::BadLength)));
  }
}
