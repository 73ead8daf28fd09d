use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

use crate::error::KeyUnwrapError;
use crate::keys::{UnwrappedKey, load_private_key};

/// RSA private key held for the duration of a session, so a batch parses
/// the PEM once rather than per record.
#[derive(Clone)]
pub struct KeyUnwrapper {
    key: RsaPrivateKey,
}

impl KeyUnwrapper {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyUnwrapError> {
        Ok(Self::new(load_private_key(pem)?))
    }

    /// Recover one record's random key.
    ///
    /// Padding must be PKCS#1 v1.5, which is what the archive encrypts with.
    /// The primitive's error is propagated as-is; an empty result counts as
    /// a failure too.
    ///
    /// PKCS#1 v1.5 decryption in `rsa` 0.9 is exposed to the Marvin timing
    /// attack (RUSTSEC-2023-0071); do not run this where an attacker can
    /// submit ciphertexts and observe how long each unwrap takes.
    pub fn unwrap_key(&self, encrypted_key_b64: &str) -> Result<UnwrappedKey, KeyUnwrapError> {
        let ciphertext = BASE64.decode(encrypted_key_b64.trim())?;
        let plaintext = self.key.decrypt(Pkcs1v15Encrypt, &ciphertext)?;
        if plaintext.is_empty() {
            return Err(KeyUnwrapError::EmptyKey);
        }
        Ok(UnwrappedKey::new(plaintext))
    }
}

impl fmt::Debug for KeyUnwrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyUnwrapper")
            .field("bits", &(self.key.size() * 8))
            .finish_non_exhaustive()
    }
}

/// One-shot form: parse `private_key_pem` and unwrap a single key.
pub fn unwrap_random_key(
    encrypted_key_b64: &str,
    private_key_pem: &[u8],
) -> Result<UnwrappedKey, KeyUnwrapError> {
    KeyUnwrapper::from_pem(private_key_pem)?.unwrap_key(encrypted_key_b64)
}
