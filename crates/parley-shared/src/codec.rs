//! Binary <-> text conversion for key material, nonces and ciphertext.
//!
//! Encoding is plain standard base64. Decoding is fed data read back from
//! storage or typed by users, so it repairs what it safely can (stray
//! characters, missing padding) and then insists on strictly valid base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::EncodingError;

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, EncodingError> {
    let mut cleaned: String = text.chars().filter(|c| is_alphabet(*c)).collect();

    // A single leftover symbol cannot encode a whole byte.
    if cleaned.len() % 4 == 1 {
        return Err(EncodingError::InvalidLength(cleaned.len()));
    }
    while cleaned.len() % 4 != 0 {
        cleaned.push('=');
    }

    Ok(STANDARD.decode(cleaned.as_bytes())?)
}

fn is_alphabet(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '/'
}
