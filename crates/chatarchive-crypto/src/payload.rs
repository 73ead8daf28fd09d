use aes::Aes256;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use zeroize::Zeroizing;

use chatarchive_types::{DecryptedMessage, MessageContent, PlainChatMessage};

use crate::error::PayloadDecryptError;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const AES_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// The archive pads to 32-byte blocks, so pad values run up to 32 rather
/// than the usual 16.
pub const MAX_PAD: usize = 32;

/// Turn an unwrapped random key into the AES-256 key.
///
/// The archive issues the random key as 43 characters of unpadded base64;
/// raw 32-byte keys are accepted as-is.
pub(crate) fn aes_key(random_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, PayloadDecryptError> {
    let decoded = match random_key.len() {
        AES_KEY_LEN => return Ok(Zeroizing::new(random_key.to_vec())),
        43 => {
            let mut padded = Zeroizing::new(Vec::with_capacity(44));
            padded.extend_from_slice(random_key);
            padded.push(b'=');
            BASE64.decode(padded.as_slice())
        }
        44 if random_key.ends_with(b"=") => BASE64.decode(random_key),
        len => return Err(PayloadDecryptError::InvalidKey { len }),
    };

    let decoded = Zeroizing::new(
        decoded.map_err(|_| PayloadDecryptError::InvalidKey { len: random_key.len() })?,
    );
    if decoded.len() != AES_KEY_LEN {
        return Err(PayloadDecryptError::InvalidKey { len: decoded.len() });
    }
    Ok(decoded)
}

fn strip_padding(buf: &mut Vec<u8>) -> Result<(), PayloadDecryptError> {
    let pad = *buf.last().ok_or(PayloadDecryptError::Padding)? as usize;
    if pad == 0 || pad > MAX_PAD || pad > buf.len() {
        return Err(PayloadDecryptError::Padding);
    }
    let start = buf.len() - pad;
    if !buf[start..].iter().all(|&b| b as usize == pad) {
        return Err(PayloadDecryptError::Padding);
    }
    buf.truncate(start);
    Ok(())
}

/// Decrypt a chat body to its plaintext JSON string.
///
/// AES-256-CBC with the IV taken from the first 16 key bytes.
pub fn decrypt_payload(
    random_key: &[u8],
    encrypted_payload_b64: &str,
) -> Result<String, PayloadDecryptError> {
    let key = aes_key(random_key)?;
    let ciphertext = BASE64.decode(encrypted_payload_b64.trim())?;

    let cipher = Aes256CbcDec::new_from_slices(&key, &key[..IV_LEN])
        .map_err(|_| PayloadDecryptError::InvalidKey { len: key.len() })?;
    let mut plaintext = cipher
        .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
        .map_err(|_| {
            PayloadDecryptError::Decrypt(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            ))
        })?;
    strip_padding(&mut plaintext)?;

    Ok(String::from_utf8(plaintext)?)
}

/// Interpret a plaintext chat body.
///
/// `text` and `image` are understood; any other `msgtype` is kept as its tag.
/// Control records without a `msgtype` (e.g. `switch`) are tagged by their
/// `action`.
pub fn parse_message(seq: u64, plaintext: &str) -> Result<DecryptedMessage, PayloadDecryptError> {
    let raw: PlainChatMessage = serde_json::from_str(plaintext)?;

    let msgtype = raw
        .msgtype
        .clone()
        .or_else(|| raw.action.clone())
        .ok_or(PayloadDecryptError::MissingField("msgtype"))?;

    let content = match msgtype.as_str() {
        "text" => {
            let body = raw
                .text
                .ok_or_else(|| PayloadDecryptError::MissingBody { msgtype: msgtype.clone() })?;
            MessageContent::Text { content: body.content }
        }
        "image" => {
            let body = raw
                .image
                .ok_or_else(|| PayloadDecryptError::MissingBody { msgtype: msgtype.clone() })?;
            MessageContent::Image(body)
        }
        _ => MessageContent::Other { msgtype },
    };

    Ok(DecryptedMessage {
        seq,
        msgid: raw.msgid,
        action: raw.action,
        from: raw.from,
        tolist: raw.tolist,
        roomid: raw.roomid.filter(|r| !r.is_empty()),
        msgtime: raw.msgtime,
        content,
    })
}

/// Decrypt and parse in one go.
pub fn decrypt_message(
    seq: u64,
    random_key: &[u8],
    encrypted_payload_b64: &str,
) -> Result<DecryptedMessage, PayloadDecryptError> {
    let plaintext = decrypt_payload(random_key, encrypted_payload_b64)?;
    parse_message(seq, &plaintext)
}
