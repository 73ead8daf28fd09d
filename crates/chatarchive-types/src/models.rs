use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One entry of the `chatdata` array returned by a batch fetch.
///
/// The archive only ever hands us ciphertext: the random key is RSA-encrypted
/// for our public key and the chat body is encrypted under that random key.
/// Both are base64 text exactly as delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub seq: u64,
    #[serde(default)]
    pub msgid: String,
    #[serde(default)]
    pub publickey_ver: u32,
    pub encrypt_random_key: String,
    pub encrypt_chat_msg: String,
}

/// Envelope of a batch fetch response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatDataResponse {
    #[serde(default)]
    pub errcode: i32,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub chatdata: Vec<EncryptedRecord>,
}

// -- Plaintext message JSON --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBody {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBody {
    pub sdkfileid: String,
    #[serde(default)]
    pub md5sum: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
}

/// The decrypted chat body as the archive serializes it.
///
/// Only `msgtime` and `msgtype` are structurally required; everything else is
/// optional because control records (e.g. `switch`) carry a reduced shape.
#[derive(Debug, Clone, Deserialize)]
pub struct PlainChatMessage {
    #[serde(default)]
    pub msgid: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub tolist: Vec<String>,
    #[serde(default)]
    pub roomid: Option<String>,
    /// Milliseconds since the Unix epoch. `switch` records name it `time`.
    #[serde(alias = "time")]
    pub msgtime: i64,
    #[serde(default)]
    pub msgtype: Option<String>,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub image: Option<ImageBody>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text { content: String },
    Image(ImageBody),
    /// Anything we do not interpret, kept as its `msgtype` tag.
    Other { msgtype: String },
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image(_) => MessageKind::Image,
            Self::Other { .. } => MessageKind::Other,
        }
    }
}

/// A chat record after both decryption stages and JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    pub seq: u64,
    pub msgid: String,
    pub action: Option<String>,
    pub from: Option<String>,
    pub tolist: Vec<String>,
    pub roomid: Option<String>,
    pub msgtime: i64,
    pub content: MessageContent,
}

impl DecryptedMessage {
    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }
}

/// Media still to be fetched for a rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTarget {
    pub sdk_file_id: String,
    pub path: PathBuf,
    pub md5sum: Option<String>,
}

/// What a driver prints: a second-resolution timestamp and a content string.
///
/// For images `content` is the local path the attachment is (or will be)
/// written to, and `media` says what to download there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub seq: u64,
    pub msgid: String,
    pub timestamp: String,
    pub content: String,
    pub media: Option<MediaTarget>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_data_envelope_parses_in_delivery_order() {
        let body = r#"{
            "errcode": 0,
            "errmsg": "ok",
            "chatdata": [
                {"seq": 7, "msgid": "a", "publickey_ver": 2,
                 "encrypt_random_key": "k1", "encrypt_chat_msg": "m1"},
                {"seq": 3, "msgid": "b", "publickey_ver": 2,
                 "encrypt_random_key": "k2", "encrypt_chat_msg": "m2"}
            ]
        }"#;
        let resp: ChatDataResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.errcode, 0);
        let seqs: Vec<u64> = resp.chatdata.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![7, 3]);
        assert_eq!(resp.chatdata[1].encrypt_random_key, "k2");
    }

    #[test]
    fn missing_chatdata_is_empty() {
        let resp: ChatDataResponse = serde_json::from_str(r#"{"errcode":0}"#).unwrap();
        assert!(resp.chatdata.is_empty());
    }

    #[test]
    fn switch_record_uses_time_alias() {
        let body = r#"{"msgid":"s1","action":"switch","time":1554119421840,"user":"someone"}"#;
        let msg: PlainChatMessage = serde_json::from_str(body).unwrap();
        assert_eq!(msg.msgtime, 1554119421840);
        assert_eq!(msg.action.as_deref(), Some("switch"));
        assert!(msg.msgtype.is_none());
    }

    #[test]
    fn content_kind() {
        let text = MessageContent::Text { content: "hi".into() };
        let other = MessageContent::Other { msgtype: "sticker".into() };
        assert_eq!(text.kind(), MessageKind::Text);
        assert_eq!(other.kind(), MessageKind::Other);
    }
}
