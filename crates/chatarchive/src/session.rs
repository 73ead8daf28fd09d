use std::sync::Arc;

use tracing::{debug, info, warn};

use chatarchive_types::ContinuationToken;

use crate::backend::{ArchiveBackend, MediaDataGuard, MediaParts, SliceGuard};
use crate::config::SessionOptions;
use crate::error::{ArchiveError, MediaFetchError, Result};

/// One authenticated handle on the archive backend.
///
/// The SDK handle is created in [`Session::open`] and destroyed exactly once:
/// by [`Session::close`], or on drop if it was never closed. A failed `init`
/// destroys it before the error is returned.
pub struct Session<B: ArchiveBackend> {
    backend: Arc<B>,
    sdk: Option<B::Sdk>,
    corp_id: String,
    options: SessionOptions,
}

impl<B: ArchiveBackend> Session<B> {
    pub fn open(
        backend: Arc<B>,
        corp_id: &str,
        secret: &str,
        options: SessionOptions,
    ) -> Result<Self> {
        let sdk = backend.new_sdk();
        let mut session = Self {
            backend,
            sdk: Some(sdk),
            corp_id: corp_id.to_string(),
            options,
        };

        let code = session.backend.init(session.sdk()?, corp_id, secret);
        if code != 0 {
            warn!("Archive SDK init failed for corp {}: code {}", session.corp_id, code);
            session.close();
            return Err(ArchiveError::Initialization { code });
        }

        info!(
            "Archive session opened for corp {} (timeout {}s, proxy {})",
            session.corp_id,
            session.options.timeout_secs,
            if session.options.proxy_host.is_empty() { "none" } else { session.options.proxy_host.as_str() }
        );
        Ok(session)
    }

    /// Release the SDK handle. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(sdk) = self.sdk.take() {
            self.backend.destroy_sdk(sdk);
            info!("Archive session closed for corp {}", self.corp_id);
        }
    }

    pub fn is_open(&self) -> bool {
        self.sdk.is_some()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn sdk(&self) -> Result<&B::Sdk> {
        self.sdk.as_ref().ok_or(ArchiveError::SessionClosed)
    }

    /// Raw batch fetch: the backend's response bytes for records after `seq`.
    ///
    /// The output slice is freed before this returns, on success and on error.
    pub fn fetch_encrypted_batch(&self, seq: u64, limit: u32) -> Result<Vec<u8>> {
        let sdk = self.sdk()?;
        let backend = self.backend.as_ref();

        let mut slice = SliceGuard::new(backend);
        let code = backend.get_chat_data(sdk, seq, limit, &self.options, slice.get_mut());
        if code != 0 {
            return Err(ArchiveError::Fetch { code, message: None });
        }
        let body = backend.slice_content(slice.get());
        debug!("Fetched chat data after seq {}: {} bytes", seq, body.len());
        Ok(body)
    }

    /// Raw media fetch: one chunk of `sdk_file_id` starting at `index`.
    ///
    /// The media-data block is freed before this returns, on success and on
    /// error.
    pub fn fetch_media_chunk(
        &self,
        index: &ContinuationToken,
        sdk_file_id: &str,
    ) -> std::result::Result<MediaParts, MediaFetchError> {
        let sdk = self.sdk.as_ref().ok_or(MediaFetchError::SessionClosed)?;
        let backend = self.backend.as_ref();

        let mut media = MediaDataGuard::new(backend);
        let code = backend.get_media_data(
            sdk,
            index.as_bytes(),
            sdk_file_id,
            &self.options,
            media.get_mut(),
        );
        if code != 0 {
            return Err(MediaFetchError::Backend {
                code,
                sdk_file_id: sdk_file_id.to_string(),
            });
        }
        Ok(backend.media_parts(media.get()))
    }
}

impl<B: ArchiveBackend> Drop for Session<B> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ERR_NETWORK, InMemoryBackend};

    fn open(backend: &Arc<InMemoryBackend>) -> Session<InMemoryBackend> {
        Session::open(backend.clone(), "corp", "secret", SessionOptions::default()).unwrap()
    }

    #[test]
    fn close_is_idempotent() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut session = open(&backend);
        assert!(session.is_open());
        session.close();
        session.close();
        assert!(!session.is_open());
        drop(session);

        let stats = backend.stats();
        assert_eq!(stats.sdks_created, 1);
        assert_eq!(stats.sdks_destroyed, 1);
        assert_eq!(stats.double_releases, 0);
    }

    #[test]
    fn drop_releases_handle() {
        let backend = Arc::new(InMemoryBackend::new());
        {
            let _session = open(&backend);
        }
        assert!(backend.stats().balanced());
    }

    #[test]
    fn init_failure_releases_handle_once() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_init(10007);

        let err = Session::open(backend.clone(), "corp", "bad", SessionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, ArchiveError::Initialization { code: 10007 }));

        let stats = backend.stats();
        assert_eq!(stats.sdks_created, 1);
        assert_eq!(stats.sdks_destroyed, 1);
        assert_eq!(stats.double_releases, 0);
    }

    #[test]
    fn fetch_after_close_fails() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut session = open(&backend);
        session.close();
        assert!(matches!(
            session.fetch_encrypted_batch(0, 10),
            Err(ArchiveError::SessionClosed)
        ));
        assert!(matches!(
            session.fetch_media_chunk(&ContinuationToken::initial(), "f"),
            Err(MediaFetchError::SessionClosed)
        ));
        assert_eq!(backend.stats().slices_allocated, 0);
    }

    #[test]
    fn failed_fetch_frees_slice() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_batches(ERR_NETWORK);
        let session = open(&backend);

        for _ in 0..3 {
            let err = session.fetch_encrypted_batch(0, 10).unwrap_err();
            assert!(matches!(err, ArchiveError::Fetch { code: ERR_NETWORK, .. }));
        }
        drop(session);

        let stats = backend.stats();
        assert_eq!(stats.slices_allocated, 3);
        assert!(stats.balanced());
    }

    #[test]
    fn options_reach_backend() {
        let backend = Arc::new(InMemoryBackend::new());
        let options = SessionOptions {
            timeout_secs: 25,
            ..Default::default()
        };
        let session = Session::open(backend.clone(), "corp", "secret", options).unwrap();
        session.fetch_encrypted_batch(9, 3).unwrap();

        let requests = backend.batch_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].seq, 9);
        assert_eq!(requests[0].limit, 3);
        assert_eq!(requests[0].timeout_secs, 25);
    }
}
