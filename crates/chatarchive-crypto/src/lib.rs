//! Decryption side of the archive's hybrid scheme.
//!
//! - `unwrap`: RSA (PKCS#1 v1.5) decryption of the per-message random key
//! - `payload`: AES-256-CBC decryption of the chat body and JSON parsing
//! - `keys`: private key loading and the transient unwrapped key type

pub mod error;
pub mod keys;
pub mod payload;
pub mod unwrap;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use error::{KeyUnwrapError, PayloadDecryptError};
pub use keys::{UnwrappedKey, load_private_key};
pub use payload::{decrypt_message, decrypt_payload, parse_message};
pub use unwrap::{KeyUnwrapper, unwrap_random_key};
