use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tracing::error;

use chatarchive_types::EncryptedRecord;

use crate::archive::{ChatArchive, RecordResult};
use crate::backend::ArchiveBackend;
use crate::error::{ArchiveError, MediaFetchError, Result};
use crate::media::MediaDownload;

/// One attachment to fetch into `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaJob {
    pub sdk_file_id: String,
    pub destination: PathBuf,
}

/// [`ChatArchive`] for async callers.
///
/// Backend calls block, so every one of them runs on tokio's blocking pool.
/// Record decryption and distinct attachments fan out over a `JoinSet`; the
/// chunks of one attachment are still fetched strictly in sequence.
pub struct AsyncArchive<B: ArchiveBackend + 'static> {
    inner: Arc<ChatArchive<B>>,
}

impl<B: ArchiveBackend + 'static> Clone for AsyncArchive<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn join_error(e: JoinError) -> ArchiveError {
    error!("spawn_blocking join error: {}", e);
    ArchiveError::Join(e.to_string())
}

impl<B: ArchiveBackend + 'static> AsyncArchive<B> {
    pub fn new(archive: ChatArchive<B>) -> Self {
        Self {
            inner: Arc::new(archive),
        }
    }

    pub fn archive(&self) -> &ChatArchive<B> {
        &self.inner
    }

    /// Take the archive back, e.g. to close it. Fails while clones exist.
    pub fn into_inner(self) -> std::result::Result<ChatArchive<B>, Self> {
        Arc::try_unwrap(self.inner).map_err(|inner| Self { inner })
    }

    pub async fn fetch_batch(&self, seq: u64, limit: u32) -> Result<Vec<EncryptedRecord>> {
        let archive = self.inner.clone();
        tokio::task::spawn_blocking(move || archive.fetcher().fetch_batch(seq, limit))
            .await
            .map_err(join_error)?
    }

    /// Per-record results in delivery order; records decrypt concurrently.
    pub async fn fetch_messages(&self, seq: u64, limit: u32) -> Result<Vec<RecordResult>> {
        let records = self.fetch_batch(seq, limit).await?;
        let count = records.len();

        let mut set = JoinSet::new();
        for (idx, record) in records.into_iter().enumerate() {
            let archive = self.inner.clone();
            set.spawn_blocking(move || (idx, archive.decrypt_record(&record)));
        }

        let mut slots: Vec<Option<RecordResult>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (idx, result) = joined.map_err(join_error)?;
            slots[idx] = Some(result);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Download distinct attachments concurrently, one result per job in
    /// input order. The same `sdk_file_id` or `destination` twice is refused
    /// up front.
    pub async fn download_many(
        &self,
        jobs: Vec<MediaJob>,
    ) -> Result<Vec<std::result::Result<MediaDownload, MediaFetchError>>> {
        let mut ids = HashSet::new();
        let mut destinations = HashSet::new();
        for job in &jobs {
            if !ids.insert(job.sdk_file_id.as_str()) {
                return Err(MediaFetchError::DuplicateFileId(job.sdk_file_id.clone()).into());
            }
            if !destinations.insert(job.destination.as_path()) {
                return Err(MediaFetchError::DuplicateDestination(job.destination.clone()).into());
            }
        }

        let count = jobs.len();
        let mut set = JoinSet::new();
        for (idx, job) in jobs.into_iter().enumerate() {
            let archive = self.inner.clone();
            set.spawn_blocking(move || {
                let outcome = archive
                    .media()
                    .download_to_file(&job.sdk_file_id, &job.destination);
                (idx, outcome)
            });
        }

        let mut slots: Vec<Option<std::result::Result<MediaDownload, MediaFetchError>>> =
            (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (idx, outcome) = joined.map_err(join_error)?;
            slots[idx] = Some(outcome);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}
