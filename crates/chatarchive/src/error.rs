use std::path::PathBuf;

use thiserror::Error;

use chatarchive_crypto::{KeyUnwrapError, PayloadDecryptError};

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The backend refused `init`; the SDK handle was already released.
    #[error("archive SDK init failed with code {code}")]
    Initialization { code: i32 },

    /// Non-zero status from a batch fetch. Never retried here.
    #[error("chat data fetch failed with code {code}{}", fmt_errmsg(.message))]
    Fetch { code: i32, message: Option<String> },

    #[error("session is closed")]
    SessionClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("batch response is not valid chat data JSON: {0}")]
    BatchDecode(#[from] serde_json::Error),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Media(#[from] MediaFetchError),

    #[error("private key unusable: {0}")]
    PrivateKey(#[from] KeyUnwrapError),

    #[error("configuration error for {key}: {message}")]
    Config { key: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(String),
}

fn fmt_errmsg(message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!(" ({})", m),
        _ => String::new(),
    }
}

/// Failure of a single record; the rest of its batch is unaffected.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record seq {seq}: key unwrap failed: {source}")]
    KeyUnwrap {
        seq: u64,
        #[source]
        source: KeyUnwrapError,
    },

    #[error("record seq {seq}: payload decrypt failed: {source}")]
    PayloadDecrypt {
        seq: u64,
        #[source]
        source: PayloadDecryptError,
    },
}

impl RecordError {
    pub fn seq(&self) -> u64 {
        match self {
            Self::KeyUnwrap { seq, .. } | Self::PayloadDecrypt { seq, .. } => *seq,
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaFetchError {
    /// Non-zero status from a chunk request.
    #[error("media fetch for {sdk_file_id} failed with code {code}")]
    Backend { code: i32, sdk_file_id: String },

    #[error("media I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("media download cancelled after {chunks} chunks")]
    Cancelled { chunks: u64 },

    /// The backend never reported completion within the configured ceiling.
    #[error("media download exceeded {limit} chunks without finishing")]
    ChunkLimitExceeded { limit: u64 },

    #[error("session is closed")]
    SessionClosed,

    #[error("media file {0} requested more than once in one batch")]
    DuplicateFileId(String),

    #[error("destination {} used by more than one download in one batch", .0.display())]
    DuplicateDestination(PathBuf),

    #[error("md5 mismatch for {path}: expected {expected}, got {actual}")]
    Md5Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl MediaFetchError {
    /// Backend status code, when the failure came from the backend.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Backend { code, .. } => Some(*code),
            _ => None,
        }
    }
}
