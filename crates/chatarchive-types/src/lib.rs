pub mod media;
pub mod models;

pub use media::{ContinuationToken, MediaChunk, MediaFetchState};
pub use models::{
    ChatDataResponse, DecryptedMessage, DisplayMessage, EncryptedRecord, ImageBody, MediaTarget,
    MessageContent, MessageKind, PlainChatMessage, TextBody,
};
