use thiserror::Error;

/// Failure to recover a record's random key.
#[derive(Debug, Error)]
pub enum KeyUnwrapError {
    #[error("encrypted random key is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("private key could not be parsed: {0}")]
    InvalidPrivateKey(String),

    #[error("RSA decryption of random key failed: {0}")]
    Decrypt(#[from] rsa::Error),

    #[error("RSA decryption produced an empty key")]
    EmptyKey,
}

/// Failure to turn an encrypted chat body into a message.
///
/// Cipher failures and JSON failures are separate variants: a payload that
/// decrypts cleanly but does not parse points at a scheme mismatch rather
/// than a bad key.
#[derive(Debug, Error)]
pub enum PayloadDecryptError {
    #[error("encrypted payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("random key has unusable length {len}")]
    InvalidKey { len: usize },

    #[error("AES decryption failed: {0}")]
    Decrypt(String),

    #[error("decrypted payload has invalid padding")]
    Padding,

    #[error("decrypted payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("decrypted payload is not a valid message JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("message JSON has no `{0}` field")]
    MissingField(&'static str),

    #[error("`{msgtype}` message has no `{msgtype}` body")]
    MissingBody { msgtype: String },
}

impl PayloadDecryptError {
    /// True when the cipher stage succeeded and only interpretation failed.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedJson(_) | Self::MissingField(_) | Self::MissingBody { .. }
        )
    }
}
