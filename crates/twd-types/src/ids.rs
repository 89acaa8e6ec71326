// SPDX-License-Identifier: MIT OR Apache-2.0

//! Base64URL identifier codec.
//!
//! The twin's REST API and its event topics both carry entity identifiers as
//! unpadded URL-safe Base64. Encoding and decoding must be an exact bijection
//! for arbitrary UTF-8 identifiers.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Error decoding a Base64URL identifier segment.
#[derive(Debug, thiserror::Error)]
pub enum IdCodecError {
    /// The segment is not valid unpadded URL-safe Base64.
    #[error("invalid base64url segment: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded bytes are not valid UTF-8.
    #[error("identifier is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encode an identifier as unpadded URL-safe Base64.
#[must_use]
pub fn b64url_encode(id: &str) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

/// Decode an unpadded URL-safe Base64 segment back into an identifier.
///
/// # Errors
///
/// Returns [`IdCodecError`] when the segment is not valid Base64 or does not
/// decode to UTF-8.
pub fn b64url_decode(segment: &str) -> Result<String, IdCodecError> {
    let raw = URL_SAFE_NO_PAD.decode(segment.as_bytes())?;
    Ok(String::from_utf8(raw)?)
}
