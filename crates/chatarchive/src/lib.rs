//! Retrieval and decryption of archived enterprise chat records.
//!
//! A [`Session`] owns one handle on the archive backend. On top of it:
//! - [`ChatBatchFetcher`] pages encrypted records by sequence cursor
//! - [`MediaDownloader`] pulls attachments chunk by chunk with an opaque
//!   continuation token
//! - [`ChatArchive`] ties fetch, key unwrap, payload decryption and
//!   rendering together; [`AsyncArchive`] runs it on tokio's blocking pool

pub mod archive;
pub mod async_archive;
pub mod backend;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod media;
pub mod memory;
pub mod render;
pub mod session;

pub use archive::{ChatArchive, RecordResult};
pub use async_archive::{AsyncArchive, MediaJob};
pub use backend::{ArchiveBackend, MediaParts};
pub use config::{ArchiveConfig, SessionOptions};
pub use error::{ArchiveError, MediaFetchError, RecordError, Result};
pub use fetcher::{ChatBatchFetcher, next_seq};
pub use logging::{MediaEvent, MediaLog, MediaLogger, NullLogger, TracingLogger};
pub use media::{DEFAULT_MAX_MEDIA_CHUNKS, DownloadProgress, MediaDownload, MediaDownloader, verify_md5};
pub use memory::InMemoryBackend;
pub use render::{MessageRenderer, format_msgtime};
pub use session::Session;

pub use chatarchive_crypto::KeyUnwrapper;
pub use chatarchive_types as types;
