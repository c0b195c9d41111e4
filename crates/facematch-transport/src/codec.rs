//! Base64 payload codec for images carried inside JSON messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub use base64::DecodeError;

/// Encode raw bytes with the standard base64 alphabet.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a standard-alphabet base64 string. Surrounding whitespace is ignored.
pub fn decode(text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(text.trim())
}
