/// Errors from hashing and hex conversion.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid hex digit {character:?} at position {position}")]
    InvalidHex { position: usize, character: char },

    #[error("invalid hex length: expected {expected}, got {actual}")]
    InvalidHexLength { expected: usize, actual: usize },

    #[error("invalid digest length: expected {expected}, got {actual}")]
    InvalidDigestLength { expected: usize, actual: usize },

    #[error("SHA-1 collision attack detected")]
    Sha1Collision,
}
