//! Structured events for media downloads.
//!
//! The downloader reports what happens to each attachment through a
//! [`MediaLogger`], so embedders can route events to tracing, a metrics
//! sink, or nowhere.

use std::fmt;
use std::path::PathBuf;

/// One media event, tagged with the attachment it concerns.
#[derive(Debug, Clone)]
pub struct MediaLog {
    pub sdk_file_id: String,
    pub event: MediaEvent,
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// Download loop started
    Started {
        destination: Option<PathBuf>,
    },
    /// One chunk appended to the sink
    ChunkReceived {
        chunk_idx: u64,
        size: usize,
        finished: bool,
    },
    /// Backend reported completion
    Completed {
        total_bytes: u64,
        chunks: u64,
        duration_ms: u64,
    },
    /// Caller cancelled between chunks
    Cancelled {
        chunks: u64,
    },
    /// Incomplete destination file deleted
    PartialRemoved {
        path: PathBuf,
    },
    Error {
        message: String,
    },
}

impl fmt::Display for MediaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { destination: Some(path) } => {
                write!(f, "download_started dest={}", path.display())
            }
            Self::Started { destination: None } => write!(f, "download_started dest=<writer>"),
            Self::ChunkReceived { chunk_idx, size, finished } => {
                write!(f, "chunk_received idx={} size={} finished={}", chunk_idx, size, finished)
            }
            Self::Completed { total_bytes, chunks, duration_ms } => {
                write!(f, "download_complete bytes={} chunks={} duration_ms={}", total_bytes, chunks, duration_ms)
            }
            Self::Cancelled { chunks } => write!(f, "download_cancelled after_chunks={}", chunks),
            Self::PartialRemoved { path } => write!(f, "partial_removed path={}", path.display()),
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Trait for media logging.
pub trait MediaLogger: Send + Sync {
    fn log(&self, entry: MediaLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl MediaLogger for TracingLogger {
    fn log(&self, entry: MediaLog) {
        let file = short_id(&entry.sdk_file_id);
        // Per-chunk events are debug, lifecycle is info
        match &entry.event {
            MediaEvent::ChunkReceived { .. } => {
                tracing::debug!(sdk_file_id = %file, "{}", entry.event);
            }
            MediaEvent::Error { .. } => {
                tracing::warn!(sdk_file_id = %file, "{}", entry.event);
            }
            _ => {
                tracing::info!(sdk_file_id = %file, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all entries.
pub struct NullLogger;

impl MediaLogger for NullLogger {
    fn log(&self, _entry: MediaLog) {}
}

/// Attachment ids run to hundreds of characters; the head is enough to
/// correlate log lines.
fn short_id(id: &str) -> &str {
    match id.char_indices().nth(24) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let e = MediaEvent::ChunkReceived { chunk_idx: 2, size: 4096, finished: false };
        assert_eq!(e.to_string(), "chunk_received idx=2 size=4096 finished=false");

        let e = MediaEvent::Completed { total_bytes: 8202, chunks: 3, duration_ms: 5 };
        assert_eq!(e.to_string(), "download_complete bytes=8202 chunks=3 duration_ms=5");
    }

    #[test]
    fn short_id_truncates_long_ids() {
        let long = "x".repeat(300);
        assert_eq!(short_id(&long).len(), 24);
        assert_eq!(short_id("abc"), "abc");
    }
}
