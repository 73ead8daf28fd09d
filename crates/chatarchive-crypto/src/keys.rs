use std::fmt;

use rsa::RsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::KeyUnwrapError;

/// Parse a PEM private key, accepting PKCS#1 (`RSA PRIVATE KEY`) and
/// PKCS#8 (`PRIVATE KEY`) encodings.
pub fn load_private_key(pem: &[u8]) -> Result<RsaPrivateKey, KeyUnwrapError> {
    let pem = std::str::from_utf8(pem)
        .map_err(|e| KeyUnwrapError::InvalidPrivateKey(format!("PEM is not UTF-8: {}", e)))?;
    let pem = pem.trim();

    let key = match RsaPrivateKey::from_pkcs1_pem(pem) {
        Ok(key) => key,
        Err(pkcs1_err) => RsaPrivateKey::from_pkcs8_pem(pem).map_err(|pkcs8_err| {
            KeyUnwrapError::InvalidPrivateKey(format!(
                "not PKCS#1 ({}) nor PKCS#8 ({})",
                pkcs1_err, pkcs8_err
            ))
        })?,
    };
    debug!("Loaded {}-bit RSA private key", key.size() * 8);
    Ok(key)
}

/// A record's random key after RSA decryption.
///
/// Lives for one record only; the bytes are wiped when it is dropped.
pub struct UnwrappedKey(Zeroizing<Vec<u8>>);

impl UnwrappedKey {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for UnwrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnwrappedKey(<{} bytes redacted>)", self.0.len())
    }
}
