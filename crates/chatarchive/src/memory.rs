use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use chatarchive_types::{ChatDataResponse, EncryptedRecord};

use crate::backend::{ArchiveBackend, MediaParts};
use crate::config::SessionOptions;

pub const ERR_PARAM: i32 = 10000;
pub const ERR_NETWORK: i32 = 10001;
pub const ERR_SYSTEM: i32 = 10003;
pub const ERR_FILE_ID: i32 = 10005;

/// In-process archive backend.
///
/// Serves scripted chat records and media, can be told to fail specific
/// calls, and counts every allocation and release so tests can check that
/// each one is paired. Continuation tokens it hands out are random and only
/// valid if sent back byte for byte.
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
    next_sdk_id: AtomicU64,
    sdks_created: AtomicUsize,
    sdks_destroyed: AtomicUsize,
    slices_allocated: AtomicUsize,
    slices_freed: AtomicUsize,
    media_allocated: AtomicUsize,
    media_freed: AtomicUsize,
    double_releases: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    init_code: i32,
    records: Vec<EncryptedRecord>,
    batch_failure: Option<i32>,
    raw_batch: Option<Vec<u8>>,
    media: HashMap<String, MediaScript>,
    issued_tokens: HashMap<Vec<u8>, (String, usize)>,
    destroyed_sdks: HashSet<u64>,
    batch_requests: Vec<BatchRequest>,
    media_requests: Vec<MediaRequest>,
}

#[derive(Default)]
struct MediaScript {
    chunks: Vec<Vec<u8>>,
    fail_at: Option<(usize, i32)>,
    endless: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub seq: u64,
    pub limit: u32,
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub sdk_file_id: String,
    pub index: Vec<u8>,
    pub timeout_secs: u32,
}

/// Allocation/release counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub sdks_created: usize,
    pub sdks_destroyed: usize,
    pub slices_allocated: usize,
    pub slices_freed: usize,
    pub media_allocated: usize,
    pub media_freed: usize,
    pub double_releases: usize,
}

impl BackendStats {
    /// Every allocation has been released exactly once.
    pub fn balanced(&self) -> bool {
        self.sdks_created == self.sdks_destroyed
            && self.slices_allocated == self.slices_freed
            && self.media_allocated == self.media_freed
            && self.double_releases == 0
    }
}

pub struct MemorySdk {
    id: u64,
    initialized: AtomicBool,
}

pub struct MemorySlice {
    buf: Vec<u8>,
    freed: bool,
}

pub struct MemoryMedia {
    parts: MediaParts,
    freed: bool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_sdk_id: AtomicU64::new(1),
            sdks_created: AtomicUsize::new(0),
            sdks_destroyed: AtomicUsize::new(0),
            slices_allocated: AtomicUsize::new(0),
            slices_freed: AtomicUsize::new(0),
            media_allocated: AtomicUsize::new(0),
            media_freed: AtomicUsize::new(0),
            double_releases: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Scripting --

    /// Make every subsequent `init` return `code`.
    pub fn fail_init(&self, code: i32) {
        self.lock().init_code = code;
    }

    pub fn push_record(&self, record: EncryptedRecord) {
        self.lock().records.push(record);
    }

    pub fn push_records(&self, records: impl IntoIterator<Item = EncryptedRecord>) {
        self.lock().records.extend(records);
    }

    /// Make batch fetches return `code` until cleared.
    pub fn fail_batches(&self, code: i32) {
        self.lock().batch_failure = Some(code);
    }

    pub fn clear_batch_failure(&self) {
        self.lock().batch_failure = None;
    }

    /// Serve these exact bytes as the next batch responses.
    pub fn set_raw_batch(&self, bytes: impl Into<Vec<u8>>) {
        self.lock().raw_batch = Some(bytes.into());
    }

    pub fn add_media(&self, sdk_file_id: impl Into<String>, chunks: Vec<Vec<u8>>) {
        self.lock().media.insert(
            sdk_file_id.into(),
            MediaScript {
                chunks,
                ..Default::default()
            },
        );
    }

    /// Media that never reports completion, returning `chunk` forever.
    pub fn add_endless_media(&self, sdk_file_id: impl Into<String>, chunk: Vec<u8>) {
        self.lock().media.insert(
            sdk_file_id.into(),
            MediaScript {
                chunks: vec![chunk],
                endless: true,
                ..Default::default()
            },
        );
    }

    /// Fail the request for chunk `chunk_idx` (0-based) of a file with `code`.
    pub fn fail_media_at(&self, sdk_file_id: &str, chunk_idx: usize, code: i32) {
        if let Some(script) = self.lock().media.get_mut(sdk_file_id) {
            script.fail_at = Some((chunk_idx, code));
        }
    }

    // -- Inspection --

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            sdks_created: self.sdks_created.load(Ordering::SeqCst),
            sdks_destroyed: self.sdks_destroyed.load(Ordering::SeqCst),
            slices_allocated: self.slices_allocated.load(Ordering::SeqCst),
            slices_freed: self.slices_freed.load(Ordering::SeqCst),
            media_allocated: self.media_allocated.load(Ordering::SeqCst),
            media_freed: self.media_freed.load(Ordering::SeqCst),
            double_releases: self.double_releases.load(Ordering::SeqCst),
        }
    }

    pub fn batch_requests(&self) -> Vec<BatchRequest> {
        self.lock().batch_requests.clone()
    }

    pub fn media_requests(&self) -> Vec<MediaRequest> {
        self.lock().media_requests.clone()
    }

    fn batch_body(inner: &Inner, seq: u64, limit: u32) -> Option<Vec<u8>> {
        if let Some(raw) = &inner.raw_batch {
            return Some(raw.clone());
        }
        let chatdata: Vec<EncryptedRecord> = inner
            .records
            .iter()
            .filter(|r| r.seq > seq)
            .take(limit as usize)
            .cloned()
            .collect();
        let response = ChatDataResponse {
            errcode: 0,
            errmsg: "ok".into(),
            chatdata,
        };
        serde_json::to_vec(&response).ok()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBackend for InMemoryBackend {
    type Sdk = MemorySdk;
    type Slice = MemorySlice;
    type Media = MemoryMedia;

    fn new_sdk(&self) -> MemorySdk {
        self.sdks_created.fetch_add(1, Ordering::SeqCst);
        MemorySdk {
            id: self.next_sdk_id.fetch_add(1, Ordering::SeqCst),
            initialized: AtomicBool::new(false),
        }
    }

    fn init(&self, sdk: &MemorySdk, _corp_id: &str, _secret: &str) -> i32 {
        let code = self.lock().init_code;
        if code == 0 {
            sdk.initialized.store(true, Ordering::SeqCst);
        }
        code
    }

    fn destroy_sdk(&self, sdk: MemorySdk) {
        if self.lock().destroyed_sdks.insert(sdk.id) {
            self.sdks_destroyed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.double_releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn new_slice(&self) -> MemorySlice {
        self.slices_allocated.fetch_add(1, Ordering::SeqCst);
        MemorySlice {
            buf: Vec::new(),
            freed: false,
        }
    }

    fn get_chat_data(
        &self,
        sdk: &MemorySdk,
        seq: u64,
        limit: u32,
        options: &SessionOptions,
        out: &mut MemorySlice,
    ) -> i32 {
        let mut inner = self.lock();
        inner.batch_requests.push(BatchRequest {
            seq,
            limit,
            timeout_secs: options.timeout_secs,
        });
        if !sdk.initialized.load(Ordering::SeqCst) {
            return ERR_SYSTEM;
        }
        if let Some(code) = inner.batch_failure {
            return code;
        }
        match Self::batch_body(&inner, seq, limit) {
            Some(body) => {
                out.buf = body;
                0
            }
            None => ERR_SYSTEM,
        }
    }

    fn slice_content(&self, slice: &MemorySlice) -> Vec<u8> {
        slice.buf.clone()
    }

    fn free_slice(&self, slice: &mut MemorySlice) {
        if slice.freed {
            self.double_releases.fetch_add(1, Ordering::SeqCst);
            return;
        }
        slice.freed = true;
        slice.buf.clear();
        self.slices_freed.fetch_add(1, Ordering::SeqCst);
    }

    fn new_media_data(&self) -> MemoryMedia {
        self.media_allocated.fetch_add(1, Ordering::SeqCst);
        MemoryMedia {
            parts: MediaParts::default(),
            freed: false,
        }
    }

    fn get_media_data(
        &self,
        sdk: &MemorySdk,
        index: &[u8],
        sdk_file_id: &str,
        options: &SessionOptions,
        out: &mut MemoryMedia,
    ) -> i32 {
        let mut inner = self.lock();
        inner.media_requests.push(MediaRequest {
            sdk_file_id: sdk_file_id.to_string(),
            index: index.to_vec(),
            timeout_secs: options.timeout_secs,
        });
        if !sdk.initialized.load(Ordering::SeqCst) {
            return ERR_SYSTEM;
        }

        let chunk_idx = if index.is_empty() {
            0
        } else {
            match inner.issued_tokens.get(index) {
                Some((file, next)) if file == sdk_file_id => *next,
                _ => return ERR_PARAM,
            }
        };

        let Some(script) = inner.media.get(sdk_file_id) else {
            return ERR_FILE_ID;
        };
        if let Some((at, code)) = script.fail_at {
            if at == chunk_idx {
                return code;
            }
        }

        let (data, is_finish) = if script.endless {
            (script.chunks.first().cloned().unwrap_or_default(), false)
        } else {
            let data = script.chunks.get(chunk_idx).cloned().unwrap_or_default();
            (data, chunk_idx + 1 >= script.chunks.len())
        };

        // A served token is spent; a failed request leaves it valid for a retry.
        if !index.is_empty() {
            inner.issued_tokens.remove(index);
        }
        let token = Uuid::new_v4().as_bytes().to_vec();
        inner
            .issued_tokens
            .insert(token.clone(), (sdk_file_id.to_string(), chunk_idx + 1));

        out.parts = MediaParts {
            data,
            out_index: token,
            is_finish,
        };
        0
    }

    fn media_parts(&self, media: &MemoryMedia) -> MediaParts {
        media.parts.clone()
    }

    fn free_media_data(&self, media: &mut MemoryMedia) {
        if media.freed {
            self.double_releases.fetch_add(1, Ordering::SeqCst);
            return;
        }
        media.freed = true;
        media.parts = MediaParts::default();
        self.media_freed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64) -> EncryptedRecord {
        EncryptedRecord {
            seq,
            msgid: format!("m{}", seq),
            publickey_ver: 1,
            encrypt_random_key: "k".into(),
            encrypt_chat_msg: "c".into(),
        }
    }

    fn ready_sdk(backend: &InMemoryBackend) -> MemorySdk {
        let sdk = backend.new_sdk();
        assert_eq!(backend.init(&sdk, "corp", "secret"), 0);
        sdk
    }

    #[test]
    fn pages_after_cursor() {
        let backend = InMemoryBackend::new();
        backend.push_records((1..=5).map(record));
        let sdk = ready_sdk(&backend);

        let mut slice = backend.new_slice();
        let code = backend.get_chat_data(&sdk, 2, 2, &SessionOptions::default(), &mut slice);
        assert_eq!(code, 0);
        let resp: ChatDataResponse = serde_json::from_slice(&backend.slice_content(&slice)).unwrap();
        let seqs: Vec<u64> = resp.chatdata.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4]);

        backend.free_slice(&mut slice);
        backend.destroy_sdk(sdk);
        assert!(backend.stats().balanced());
    }

    #[test]
    fn uninitialized_sdk_is_refused() {
        let backend = InMemoryBackend::new();
        let sdk = backend.new_sdk();
        let mut slice = backend.new_slice();
        let code = backend.get_chat_data(&sdk, 0, 10, &SessionOptions::default(), &mut slice);
        assert_eq!(code, ERR_SYSTEM);
        backend.free_slice(&mut slice);
        backend.destroy_sdk(sdk);
    }

    #[test]
    fn forged_token_is_rejected() {
        let backend = InMemoryBackend::new();
        backend.add_media("f", vec![vec![1], vec![2]]);
        let sdk = ready_sdk(&backend);

        let mut media = backend.new_media_data();
        let code = backend.get_media_data(&sdk, b"1", "f", &SessionOptions::default(), &mut media);
        assert_eq!(code, ERR_PARAM);
        backend.free_media_data(&mut media);
        backend.destroy_sdk(sdk);
    }

    #[test]
    fn served_tokens_are_spent() {
        let backend = InMemoryBackend::new();
        backend.add_media("f", vec![vec![1], vec![2], vec![3]]);
        let sdk = ready_sdk(&backend);
        let opts = SessionOptions::default();

        let mut index: Vec<u8> = Vec::new();
        let mut spent = Vec::new();
        for _ in 0..3 {
            let mut media = backend.new_media_data();
            assert_eq!(backend.get_media_data(&sdk, &index, "f", &opts, &mut media), 0);
            if !index.is_empty() {
                spent.push(index.clone());
            }
            index = backend.media_parts(&media).out_index;
            backend.free_media_data(&mut media);
            assert_eq!(backend.lock().issued_tokens.len(), 1);
        }

        for old in spent {
            let mut media = backend.new_media_data();
            assert_eq!(backend.get_media_data(&sdk, &old, "f", &opts, &mut media), ERR_PARAM);
            backend.free_media_data(&mut media);
        }
        backend.destroy_sdk(sdk);
    }

    #[test]
    fn failed_request_keeps_token_for_retry() {
        let backend = InMemoryBackend::new();
        backend.add_media("f", vec![vec![1], vec![2]]);
        backend.fail_media_at("f", 1, ERR_NETWORK);
        let sdk = ready_sdk(&backend);
        let opts = SessionOptions::default();

        let mut media = backend.new_media_data();
        assert_eq!(backend.get_media_data(&sdk, &[], "f", &opts, &mut media), 0);
        let token = backend.media_parts(&media).out_index;
        backend.free_media_data(&mut media);

        let mut media = backend.new_media_data();
        assert_eq!(backend.get_media_data(&sdk, &token, "f", &opts, &mut media), ERR_NETWORK);
        backend.free_media_data(&mut media);
        assert!(backend.lock().issued_tokens.contains_key(&token));
        backend.destroy_sdk(sdk);
    }

    #[test]
    fn double_free_is_counted() {
        let backend = InMemoryBackend::new();
        let mut slice = backend.new_slice();
        backend.free_slice(&mut slice);
        backend.free_slice(&mut slice);
        let stats = backend.stats();
        assert_eq!(stats.slices_freed, 1);
        assert_eq!(stats.double_releases, 1);
        assert!(!stats.balanced());
    }
}
