use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use md5::{Digest, Md5};
use tracing::warn;

use chatarchive_types::{ContinuationToken, MediaChunk, MediaFetchState};

use crate::backend::ArchiveBackend;
use crate::error::MediaFetchError;
use crate::logging::{MediaEvent, MediaLog, MediaLogger, TracingLogger};
use crate::session::Session;

/// Default ceiling on chunk requests for one attachment.
///
/// The backend is trusted to report completion eventually; this only stops a
/// backend that never does. At the archive's usual chunk size it is far
/// beyond any real attachment.
pub const DEFAULT_MAX_MEDIA_CHUNKS: u64 = 65_536;

pub const STATE_IDLE: u8 = 0;
pub const STATE_DOWNLOADING: u8 = 1;
pub const STATE_COMPLETE: u8 = 2;
pub const STATE_ERROR: u8 = 3;
pub const STATE_CANCELLED: u8 = 4;

/// Shared progress state, polled from other threads.
pub struct DownloadProgress {
    pub bytes_done: AtomicU64,
    pub chunks_done: AtomicU64,
    pub state: AtomicU8,
    cancelled: AtomicBool,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            chunks_done: AtomicU64::new(0),
            state: AtomicU8::new(STATE_IDLE),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Ask the download to stop before its next chunk request.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Relaxed)
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDownload {
    pub sdk_file_id: String,
    pub bytes: u64,
    pub chunks: u64,
}

/// Destination file that deletes itself unless committed.
struct PartialFile {
    path: PathBuf,
    file: Option<File>,
    done: bool,
}

impl PartialFile {
    fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            done: false,
        })
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("destination file already closed"))
    }

    fn commit(&mut self) -> io::Result<()> {
        let file = self.file_mut()?;
        file.flush()?;
        file.sync_all()?;
        self.file = None;
        self.done = true;
        Ok(())
    }

    /// Close and delete. Returns the removed path.
    fn discard(mut self) -> io::Result<PathBuf> {
        self.done = true;
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(self.path.clone()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(self.path.clone()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.file = None;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove partial file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Chunked, resumable retrieval of one attachment at a time.
///
/// Every step sends the continuation token from the previous response
/// verbatim; steps for one attachment are strictly sequential.
pub struct MediaDownloader<'a, B: ArchiveBackend> {
    session: &'a Session<B>,
    logger: Arc<dyn MediaLogger>,
    max_chunks: Option<u64>,
}

impl<'a, B: ArchiveBackend> MediaDownloader<'a, B> {
    pub fn new(session: &'a Session<B>) -> Self {
        Self {
            session,
            logger: Arc::new(TracingLogger),
            max_chunks: Some(DEFAULT_MAX_MEDIA_CHUNKS),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn MediaLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// `None` removes the ceiling: the loop then ends only when the backend
    /// reports completion.
    pub fn with_max_chunks(mut self, max_chunks: Option<u64>) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    fn log(&self, sdk_file_id: &str, event: MediaEvent) {
        self.logger.log(MediaLog {
            sdk_file_id: sdk_file_id.to_string(),
            event,
        });
    }

    /// Exactly one request: the chunk at `continuation` and the state to
    /// resume from.
    pub fn fetch_one_chunk(
        &self,
        sdk_file_id: &str,
        continuation: &ContinuationToken,
    ) -> Result<MediaChunk, MediaFetchError> {
        let parts = self.session.fetch_media_chunk(continuation, sdk_file_id)?;
        Ok(MediaChunk {
            data: parts.data,
            next: MediaFetchState {
                sdk_file_id: sdk_file_id.to_string(),
                continuation: ContinuationToken::from_service(parts.out_index),
                is_finished: parts.is_finish,
            },
        })
    }

    /// Drive the download to completion into any sink.
    pub fn download_to_writer<W: Write + ?Sized>(
        &self,
        sdk_file_id: &str,
        sink: &mut W,
        progress: Option<&DownloadProgress>,
    ) -> Result<MediaDownload, MediaFetchError> {
        self.log(sdk_file_id, MediaEvent::Started { destination: None });
        self.run(sdk_file_id, sink, progress)
    }

    /// Drive the download to completion into `dest`.
    ///
    /// On any failure, including cancellation, `dest` is closed and deleted:
    /// the file is either complete or absent.
    pub fn download_to_file(
        &self,
        sdk_file_id: &str,
        dest: &Path,
    ) -> Result<MediaDownload, MediaFetchError> {
        self.download_to_file_with_progress(sdk_file_id, dest, None)
    }

    pub fn download_to_file_with_progress(
        &self,
        sdk_file_id: &str,
        dest: &Path,
        progress: Option<&DownloadProgress>,
    ) -> Result<MediaDownload, MediaFetchError> {
        self.log(
            sdk_file_id,
            MediaEvent::Started {
                destination: Some(dest.to_path_buf()),
            },
        );

        let mut partial = match PartialFile::create(dest) {
            Ok(p) => p,
            Err(e) => {
                self.log(sdk_file_id, MediaEvent::Error { message: e.to_string() });
                return Err(e.into());
            }
        };

        let written = match partial.file_mut() {
            Ok(file) => self.run(sdk_file_id, file, progress),
            Err(e) => Err(e.into()),
        };
        let result =
            written.and_then(|done| partial.commit().map(|()| done).map_err(MediaFetchError::from));

        match result {
            Ok(done) => Ok(done),
            Err(e) => {
                match partial.discard() {
                    Ok(path) => self.log(sdk_file_id, MediaEvent::PartialRemoved { path }),
                    Err(rm) => self.log(
                        sdk_file_id,
                        MediaEvent::Error {
                            message: format!("removing partial {}: {}", dest.display(), rm),
                        },
                    ),
                }
                Err(e)
            }
        }
    }

    fn run<W: Write + ?Sized>(
        &self,
        sdk_file_id: &str,
        sink: &mut W,
        progress: Option<&DownloadProgress>,
    ) -> Result<MediaDownload, MediaFetchError> {
        let started = Instant::now();
        if let Some(p) = progress {
            p.state.store(STATE_DOWNLOADING, Ordering::Relaxed);
        }

        let result = self.drive(sdk_file_id, sink, progress);

        let (state, event) = match &result {
            Ok(done) => (
                STATE_COMPLETE,
                MediaEvent::Completed {
                    total_bytes: done.bytes,
                    chunks: done.chunks,
                    duration_ms: started.elapsed().as_millis() as u64,
                },
            ),
            Err(MediaFetchError::Cancelled { chunks }) => {
                (STATE_CANCELLED, MediaEvent::Cancelled { chunks: *chunks })
            }
            Err(e) => (STATE_ERROR, MediaEvent::Error { message: e.to_string() }),
        };
        if let Some(p) = progress {
            p.state.store(state, Ordering::Relaxed);
        }
        self.log(sdk_file_id, event);
        result
    }

    fn drive<W: Write + ?Sized>(
        &self,
        sdk_file_id: &str,
        sink: &mut W,
        progress: Option<&DownloadProgress>,
    ) -> Result<MediaDownload, MediaFetchError> {
        let mut state = MediaFetchState::start(sdk_file_id);
        let mut bytes = 0u64;
        let mut chunks = 0u64;

        loop {
            if progress.is_some_and(DownloadProgress::is_cancelled) {
                return Err(MediaFetchError::Cancelled { chunks });
            }
            if let Some(limit) = self.max_chunks {
                if chunks >= limit {
                    return Err(MediaFetchError::ChunkLimitExceeded { limit });
                }
            }

            let chunk = self.fetch_one_chunk(&state.sdk_file_id, &state.continuation)?;
            sink.write_all(&chunk.data)?;

            let size = chunk.data.len();
            bytes += size as u64;
            chunks += 1;
            if let Some(p) = progress {
                p.bytes_done.fetch_add(size as u64, Ordering::Relaxed);
                p.chunks_done.fetch_add(1, Ordering::Relaxed);
            }
            self.log(
                sdk_file_id,
                MediaEvent::ChunkReceived {
                    chunk_idx: chunks - 1,
                    size,
                    finished: chunk.next.is_finished,
                },
            );

            state = chunk.next;
            if state.is_finished {
                break;
            }
        }

        sink.flush()?;
        Ok(MediaDownload {
            sdk_file_id: sdk_file_id.to_string(),
            bytes,
            chunks,
        })
    }
}

/// Check a downloaded file against the md5 the archive published for it.
pub fn verify_md5(path: &Path, expected_hex: &str) -> Result<(), MediaFetchError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected_hex.trim()) {
        return Err(MediaFetchError::Md5Mismatch {
            path: path.to_path_buf(),
            expected: expected_hex.to_string(),
            actual,
        });
    }
    Ok(())
}
