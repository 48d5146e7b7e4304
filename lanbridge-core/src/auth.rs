//! Client key and admin token checks

use lanbridge_protocol::constants::MAX_URI_LEN;
use subtle::ConstantTimeEq;

/// Constant-time comparison of two byte slices
///
/// Returns true if slices are equal, false otherwise.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Checks that a client key can travel as a frame uri and never collides
/// with the `userId@clientKey` separator.
pub fn validate_client_key(key: &str) -> Result<(), TokenValidationError> {
    if key.is_empty() {
        return Err(TokenValidationError::Empty);
    }
    if key.len() > MAX_URI_LEN {
        return Err(TokenValidationError::TooLong {
            len: key.len(),
            max: MAX_URI_LEN,
        });
    }
    if !key
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && c != '@')
    {
        return Err(TokenValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Validates a bearer header against the expected admin token.
#[must_use]
pub fn verify_bearer(header: Option<&str>, expected: &str) -> bool {
    header
        .and_then(|h| h.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.trim().as_bytes(), expected.as_bytes()))
}

/// Token validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenValidationError {
    #[error("key is empty")]
    Empty,
    #[error("key too long: {len} bytes exceeds maximum of {max} bytes")]
    TooLong { len: usize, max: usize },
    #[error("key contains invalid characters")]
    InvalidCharacters,
}

impl From<TokenValidationError> for lanbridge_common::TunnelError {
    fn from(err: TokenValidationError) -> Self {
        lanbridge_common::TunnelError::Authentication(err.to_string())
    }
}
