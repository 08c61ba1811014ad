//! Error types for the encryption layer.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The ciphertext did not authenticate: wrong key or tampered data.
    #[error("authentication failed: wrong key or tampered ciphertext")]
    AuthenticationFailure,

    /// The encoded payload could not be parsed into nonce + ciphertext.
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// A nonce was about to be used twice under the same key.
    #[error("nonce reuse detected for this key")]
    NonceReuse,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid salt length.
    #[error("invalid salt length: expected {expected}, got {actual}")]
    InvalidSaltLength { expected: usize, actual: usize },
}
