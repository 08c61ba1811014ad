//! Crypto engine for plugin storage namespaces.
//!
//! - Keys are derived from a password with PBKDF2-HMAC-SHA256 over a
//!   per-namespace salt, or generated at random for password-less sessions.
//! - Payloads are sealed with ChaCha20-Poly1305 under a fresh random nonce.
//! - A [`SealingKey`] remembers a bounded window of recently issued nonces
//!   and refuses to seal twice under one of them.

mod cipher;
mod error;
mod key;
mod sealing;

pub use cipher::{EncryptedData, NONCE_SIZE, TAG_SIZE, decrypt, encrypt};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    DEFAULT_KDF_ITERATIONS, DerivedKey, KEY_SIZE, KdfParams, SALT_SIZE, Salt, derive_key,
    generate_ephemeral_key,
};
pub use sealing::{DEFAULT_NONCE_WINDOW, SealingKey};
