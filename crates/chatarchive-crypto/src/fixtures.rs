//! Sealing helpers that produce records the way the archive does, for tests.

use std::sync::OnceLock;

use aes::Aes256;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use rand_core::{OsRng, RngCore};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::payload::{IV_LEN, MAX_PAD, aes_key};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

// Small enough to generate quickly in debug builds.
const FIXTURE_KEY_BITS: usize = 1024;

/// Process-wide fixture key, generated once.
pub fn private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut OsRng, FIXTURE_KEY_BITS).expect("generate fixture RSA key")
    })
}

pub fn private_key_pkcs1_pem() -> String {
    private_key()
        .to_pkcs1_pem(LineEnding::LF)
        .expect("encode PKCS#1 PEM")
        .to_string()
}

pub fn private_key_pkcs8_pem() -> String {
    private_key()
        .to_pkcs8_pem(LineEnding::LF)
        .expect("encode PKCS#8 PEM")
        .to_string()
}

/// A fresh random key in the archive's 43-character base64 form.
pub fn random_key_text() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    BASE64.encode(raw).trim_end_matches('=').to_string()
}

/// RSA-encrypt `random_key` for the fixture key, base64 encoded.
pub fn wrap_random_key(random_key: &[u8]) -> String {
    let public = RsaPublicKey::from(private_key());
    let ciphertext = public
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, random_key)
        .expect("RSA encrypt fixture key");
    BASE64.encode(ciphertext)
}

fn seal_with_block(random_key: &[u8], plaintext: &str, block: usize) -> String {
    let key = aes_key(random_key).expect("fixture random key");
    let mut buf = plaintext.as_bytes().to_vec();
    let pad = block - buf.len() % block;
    debug_assert!(pad <= MAX_PAD);
    buf.extend(std::iter::repeat_n(pad as u8, pad));

    let cipher = Aes256CbcEnc::new_from_slices(&key, &key[..IV_LEN]).expect("fixture key length");
    BASE64.encode(cipher.encrypt_padded_vec_mut::<NoPadding>(&buf))
}

/// AES-encrypt `plaintext` padded to 32-byte blocks, as the archive does.
pub fn seal_payload(random_key: &[u8], plaintext: &str) -> String {
    seal_with_block(random_key, plaintext, MAX_PAD)
}

/// Same, with ordinary 16-byte PKCS#7 padding.
pub fn seal_payload_block16(random_key: &[u8], plaintext: &str) -> String {
    seal_with_block(random_key, plaintext, 16)
}
