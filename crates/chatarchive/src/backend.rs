use crate::config::SessionOptions;

// ── Backend contract ────────────────────────────────────────────────────

/// What one media call leaves in its output allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaParts {
    pub data: Vec<u8>,
    /// Token to send with the next request, verbatim.
    pub out_index: Vec<u8>,
    pub is_finish: bool,
}

/// The archive SDK as seen from this crate.
///
/// Mirrors the vendor SDK's handle-based API: one SDK handle per session,
/// and an output allocation per call (a byte slice for batch fetches, a
/// media-data block for chunk fetches). Every `new_*` is paired with exactly
/// one release; callers in this crate only ever hold them through
/// [`SliceGuard`] / [`MediaDataGuard`] or the owning [`Session`], which
/// release on every exit path.
///
/// Return codes follow the SDK: `0` is success, anything else is an error
/// code to surface unchanged.
///
/// [`Session`]: crate::session::Session
pub trait ArchiveBackend: Send + Sync {
    type Sdk: Send + Sync;
    type Slice: Send;
    type Media: Send;

    fn new_sdk(&self) -> Self::Sdk;
    fn init(&self, sdk: &Self::Sdk, corp_id: &str, secret: &str) -> i32;
    fn destroy_sdk(&self, sdk: Self::Sdk);

    fn new_slice(&self) -> Self::Slice;
    fn get_chat_data(
        &self,
        sdk: &Self::Sdk,
        seq: u64,
        limit: u32,
        options: &SessionOptions,
        out: &mut Self::Slice,
    ) -> i32;
    fn slice_content(&self, slice: &Self::Slice) -> Vec<u8>;
    fn free_slice(&self, slice: &mut Self::Slice);

    fn new_media_data(&self) -> Self::Media;
    fn get_media_data(
        &self,
        sdk: &Self::Sdk,
        index: &[u8],
        sdk_file_id: &str,
        options: &SessionOptions,
        out: &mut Self::Media,
    ) -> i32;
    fn media_parts(&self, media: &Self::Media) -> MediaParts;
    fn free_media_data(&self, media: &mut Self::Media);
}

// ── Scoped allocations ──────────────────────────────────────────────────

/// Output slice of one batch fetch, freed when the guard goes out of scope.
pub(crate) struct SliceGuard<'a, B: ArchiveBackend + ?Sized> {
    backend: &'a B,
    slice: B::Slice,
}

impl<'a, B: ArchiveBackend + ?Sized> SliceGuard<'a, B> {
    pub(crate) fn new(backend: &'a B) -> Self {
        Self {
            slice: backend.new_slice(),
            backend,
        }
    }

    pub(crate) fn get(&self) -> &B::Slice {
        &self.slice
    }

    pub(crate) fn get_mut(&mut self) -> &mut B::Slice {
        &mut self.slice
    }
}

impl<B: ArchiveBackend + ?Sized> Drop for SliceGuard<'_, B> {
    fn drop(&mut self) {
        self.backend.free_slice(&mut self.slice);
    }
}

/// Output block of one media fetch, freed when the guard goes out of scope.
pub(crate) struct MediaDataGuard<'a, B: ArchiveBackend + ?Sized> {
    backend: &'a B,
    media: B::Media,
}

impl<'a, B: ArchiveBackend + ?Sized> MediaDataGuard<'a, B> {
    pub(crate) fn new(backend: &'a B) -> Self {
        Self {
            media: backend.new_media_data(),
            backend,
        }
    }

    pub(crate) fn get(&self) -> &B::Media {
        &self.media
    }

    pub(crate) fn get_mut(&mut self) -> &mut B::Media {
        &mut self.media
    }
}

impl<B: ArchiveBackend + ?Sized> Drop for MediaDataGuard<'_, B> {
    fn drop(&mut self) {
        self.backend.free_media_data(&mut self.media);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;

    #[test]
    fn slice_guard_frees_once_on_scope_exit() {
        let backend = InMemoryBackend::new();
        {
            let _a = SliceGuard::new(&backend);
            let _b = SliceGuard::new(&backend);
            assert_eq!(backend.stats().slices_allocated, 2);
            assert_eq!(backend.stats().slices_freed, 0);
        }
        let stats = backend.stats();
        assert_eq!(stats.slices_allocated, 2);
        assert_eq!(stats.slices_freed, 2);
    }

    #[test]
    fn media_guard_frees_on_unwind() {
        let backend = InMemoryBackend::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = MediaDataGuard::new(&backend);
            panic!("boom");
        }));
        assert!(result.is_err());
        let stats = backend.stats();
        assert_eq!(stats.media_allocated, 1);
        assert_eq!(stats.media_freed, 1);
    }
}
