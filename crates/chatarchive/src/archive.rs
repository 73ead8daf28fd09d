use std::fs;
use std::sync::Arc;
use std::thread;

use chrono::FixedOffset;
use tracing::{info, warn};

use chatarchive_crypto::{KeyUnwrapper, decrypt_message};
use chatarchive_types::{DecryptedMessage, DisplayMessage, EncryptedRecord};

use crate::backend::ArchiveBackend;
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, RecordError, Result};
use crate::fetcher::{ChatBatchFetcher, next_seq};
use crate::logging::{MediaLogger, TracingLogger};
use crate::media::{DEFAULT_MAX_MEDIA_CHUNKS, MediaDownloader, verify_md5};
use crate::render::MessageRenderer;
use crate::session::Session;

/// Outcome for one record of a batch.
pub type RecordResult = std::result::Result<DecryptedMessage, RecordError>;

/// Fetch, unwrap, decrypt and render over one session.
///
/// The private key is parsed once at construction. Each record's symmetric
/// key is unwrapped from that record alone and dropped (zeroed) as soon as its
/// payload is decrypted.
pub struct ChatArchive<B: ArchiveBackend> {
    session: Session<B>,
    unwrapper: KeyUnwrapper,
    renderer: MessageRenderer,
    max_media_chunks: Option<u64>,
    logger: Arc<dyn MediaLogger>,
}

impl<B: ArchiveBackend> ChatArchive<B> {
    pub fn new(session: Session<B>, unwrapper: KeyUnwrapper, renderer: MessageRenderer) -> Self {
        Self {
            session,
            unwrapper,
            renderer,
            max_media_chunks: Some(DEFAULT_MAX_MEDIA_CHUNKS),
            logger: Arc::new(TracingLogger),
        }
    }

    /// Load the key, open the session and set up rendering from `config`.
    pub fn from_config(backend: Arc<B>, config: &ArchiveConfig) -> Result<Self> {
        let pem = config.read_private_key()?;
        let unwrapper = KeyUnwrapper::from_pem(&pem)?;
        let offset: FixedOffset = config.display_offset()?;
        let session = Session::open(
            backend,
            &config.corp_id,
            &config.secret,
            config.session.clone(),
        )?;

        Ok(Self::new(session, unwrapper, MessageRenderer::new(&config.media_dir, offset))
            .with_max_media_chunks(config.max_media_chunks))
    }

    pub fn with_logger(mut self, logger: Arc<dyn MediaLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_max_media_chunks(mut self, max_chunks: Option<u64>) -> Self {
        self.max_media_chunks = max_chunks;
        self
    }

    pub fn session(&self) -> &Session<B> {
        &self.session
    }

    pub fn renderer(&self) -> &MessageRenderer {
        &self.renderer
    }

    /// Release the backend handle now rather than on drop.
    pub fn close(&mut self) {
        self.session.close();
    }

    pub fn fetcher(&self) -> ChatBatchFetcher<'_, B> {
        ChatBatchFetcher::new(&self.session)
    }

    pub fn media(&self) -> MediaDownloader<'_, B> {
        MediaDownloader::new(&self.session)
            .with_logger(self.logger.clone())
            .with_max_chunks(self.max_media_chunks)
    }

    // ── Decryption ──

    pub fn decrypt_record(&self, record: &EncryptedRecord) -> RecordResult {
        let key = self
            .unwrapper
            .unwrap_key(&record.encrypt_random_key)
            .map_err(|source| RecordError::KeyUnwrap { seq: record.seq, source })?;

        decrypt_message(record.seq, key.as_bytes(), &record.encrypt_chat_msg)
            .map_err(|source| RecordError::PayloadDecrypt { seq: record.seq, source })
    }

    /// One result per record, in input order.
    pub fn decrypt_batch(&self, records: &[EncryptedRecord]) -> Vec<RecordResult> {
        records.iter().map(|r| self.decrypt_record(r)).collect()
    }

    /// Same as [`decrypt_batch`](Self::decrypt_batch), spread over up to
    /// `workers` threads. Result order matches input order.
    pub fn decrypt_batch_concurrent(
        &self,
        records: &[EncryptedRecord],
        workers: usize,
    ) -> Vec<RecordResult> {
        let workers = workers.clamp(1, records.len().max(1));
        if workers == 1 {
            return self.decrypt_batch(records);
        }
        let per_worker = records.len().div_ceil(workers);

        thread::scope(|scope| {
            let handles: Vec<_> = records
                .chunks(per_worker)
                .map(|part| scope.spawn(move || self.decrypt_batch(part)))
                .collect();

            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }

    // ── Batches ──

    /// Fetch one page and decrypt every record independently.
    ///
    /// A bad record yields an `Err` in its slot; the rest of the page is
    /// unaffected. Fetch-level failures fail the whole call.
    pub fn fetch_messages(&self, seq: u64, limit: u32) -> Result<Vec<RecordResult>> {
        let records = self.fetcher().fetch_batch(seq, limit)?;
        let results = self.decrypt_batch(&records);
        log_outcome(seq, &results);
        Ok(results)
    }

    /// Fetch one page and fail on the first record that does not decrypt.
    pub fn fetch_messages_strict(&self, seq: u64, limit: u32) -> Result<Vec<DecryptedMessage>> {
        let records = self.fetcher().fetch_batch(seq, limit)?;
        records
            .iter()
            .map(|r| self.decrypt_record(r).map_err(ArchiveError::from))
            .collect()
    }

    /// Page from `start_seq` until the archive returns an empty page.
    ///
    /// Returns every record's outcome and the cursor to resume from.
    pub fn fetch_since(&self, start_seq: u64, page_limit: u32) -> Result<(Vec<RecordResult>, u64)> {
        let fetcher = self.fetcher();
        let mut cursor = start_seq;
        let mut all = Vec::new();

        loop {
            let records = fetcher.fetch_batch(cursor, page_limit)?;
            if records.is_empty() {
                break;
            }
            let next = next_seq(cursor, &records);
            let results = self.decrypt_batch(&records);
            log_outcome(cursor, &results);
            all.extend(results);
            if next == cursor {
                // a page that does not advance the cursor would repeat forever
                warn!("Chat data page after seq {} did not advance the cursor", cursor);
                break;
            }
            cursor = next;
        }
        Ok((all, cursor))
    }

    // ── Display ──

    pub fn render(&self, message: &DecryptedMessage) -> Result<DisplayMessage> {
        self.renderer.render(message)
    }

    /// Render a message and, for images, download the attachment to the
    /// reserved path. A published md5 is checked; a mismatching file is
    /// removed.
    pub fn display(&self, message: &DecryptedMessage) -> Result<DisplayMessage> {
        let shown = self.renderer.render(message)?;
        if let Some(target) = &shown.media {
            self.media().download_to_file(&target.sdk_file_id, &target.path)?;
            if let Some(expected) = target.md5sum.as_deref().filter(|m| !m.is_empty()) {
                if let Err(e) = verify_md5(&target.path, expected) {
                    if let Err(rm) = fs::remove_file(&target.path) {
                        warn!("Could not remove {}: {}", target.path.display(), rm);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(shown)
    }

    /// One page as printable lines, media downloaded. Per-record results.
    pub fn fetch_display(&self, seq: u64, limit: u32) -> Result<Vec<Result<DisplayMessage>>> {
        let results = self.fetch_messages(seq, limit)?;
        Ok(results
            .into_iter()
            .map(|r| {
                let message = r?;
                self.display(&message)
            })
            .collect())
    }
}

fn log_outcome(seq: u64, results: &[RecordResult]) {
    let failed = results.iter().filter(|r| r.is_err()).count();
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        warn!("Skipping record seq {}: {}", err.seq(), err);
    }
    info!(
        "Decrypted page after seq {}: {} ok, {} failed",
        seq,
        results.len() - failed,
        failed
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOptions;
    use crate::logging::NullLogger;
    use crate::memory::InMemoryBackend;
    use chatarchive_crypto::fixtures;
    use chatarchive_types::{MessageContent, MessageKind};
    use serde_json::json;

    fn sealed(seq: u64, body: serde_json::Value) -> EncryptedRecord {
        let key = fixtures::random_key_text();
        EncryptedRecord {
            seq,
            msgid: format!("m{}", seq),
            publickey_ver: 1,
            encrypt_random_key: fixtures::wrap_random_key(key.as_bytes()),
            encrypt_chat_msg: fixtures::seal_payload(key.as_bytes(), &body.to_string()),
        }
    }

    fn text(seq: u64, content: &str) -> EncryptedRecord {
        sealed(
            seq,
            json!({
                "msgid": format!("m{}", seq),
                "action": "send",
                "from": "alice",
                "tolist": ["bob"],
                "msgtime": 1_700_000_000_000i64 + seq as i64,
                "msgtype": "text",
                "text": { "content": content }
            }),
        )
    }

    fn archive(backend: &Arc<InMemoryBackend>, media_dir: &std::path::Path) -> ChatArchive<InMemoryBackend> {
        let session = Session::open(backend.clone(), "corp", "secret", SessionOptions::default()).unwrap();
        let unwrapper = KeyUnwrapper::new(fixtures::private_key().clone());
        let renderer = MessageRenderer::new(media_dir, FixedOffset::east_opt(0).unwrap());
        ChatArchive::new(session, unwrapper, renderer).with_logger(Arc::new(NullLogger))
    }

    #[test]
    fn one_bad_key_spoils_only_its_record() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut bad = text(2, "two");
        bad.encrypt_random_key = "AAAA".into();
        backend.push_records([text(1, "one"), bad, text(3, "three")]);
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(&backend, dir.path());

        let results = archive.fetch_messages(0, 10).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        match &results[1] {
            Err(RecordError::KeyUnwrap { seq, .. }) => assert_eq!(*seq, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn strict_mode_fails_the_batch() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut bad = text(2, "two");
        bad.encrypt_chat_msg = "!!".into();
        backend.push_records([text(1, "one"), bad]);
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(&backend, dir.path());

        let err = archive.fetch_messages_strict(0, 10).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Record(RecordError::PayloadDecrypt { seq: 2, .. })
        ));
    }

    #[test]
    fn concurrent_decrypt_preserves_order() {
        let backend = Arc::new(InMemoryBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(&backend, dir.path());
        let records: Vec<_> = (1..=9).map(|s| text(s, &format!("msg {}", s))).collect();

        let results = archive.decrypt_batch_concurrent(&records, 4);
        let seqs: Vec<u64> = results.iter().map(|r| r.as_ref().unwrap().seq).collect();
        assert_eq!(seqs, (1..=9).collect::<Vec<_>>());
        assert_eq!(
            results[4].as_ref().unwrap().content,
            MessageContent::Text { content: "msg 5".into() }
        );
    }

    #[test]
    fn fetch_since_pages_to_the_end() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.push_records((1..=5).map(|s| text(s, "x")));
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(&backend, dir.path());

        let (results, cursor) = archive.fetch_since(0, 2).unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(cursor, 5);
        let seqs: Vec<u64> = backend.batch_requests().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 2, 4, 5]);
    }

    #[test]
    fn display_downloads_images() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_media("sdk-img", vec![b"abc".to_vec(), b"def".to_vec()]);
        backend.push_records([
            text(1, "hello"),
            sealed(
                2,
                json!({
                    "msgid": "m2",
                    "msgtime": 1_700_000_000_999i64,
                    "msgtype": "image",
                    "image": { "sdkfileid": "sdk-img", "md5sum": "e80b5017098950fc58aad83c8c14978e", "filesize": 6 }
                }),
            ),
            sealed(3, json!({ "msgid": "m3", "msgtime": 1_700_000_001_000i64, "msgtype": "sticker", "sticker": {} })),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(&backend, dir.path());

        let shown: Vec<DisplayMessage> = archive
            .fetch_display(0, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(shown[0].content, "hello");
        assert_eq!(shown[0].timestamp, shown[1].timestamp);
        assert_eq!(shown[2].content, "sticker");

        let target = shown[1].media.as_ref().unwrap();
        assert_eq!(fs::read(&target.path).unwrap(), b"abcdef");
    }

    #[test]
    fn md5_mismatch_removes_download() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_media("sdk-img", vec![b"abc".to_vec()]);
        backend.push_record(sealed(
            1,
            json!({
                "msgtime": 0,
                "msgtype": "image",
                "image": { "sdkfileid": "sdk-img", "md5sum": "00000000000000000000000000000000" }
            }),
        ));
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(&backend, dir.path());

        let messages = archive.fetch_messages_strict(0, 10).unwrap();
        assert_eq!(messages[0].kind(), MessageKind::Image);
        let err = archive.display(&messages[0]).unwrap_err();
        assert!(matches!(err, ArchiveError::Media(crate::error::MediaFetchError::Md5Mismatch { .. })));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn close_releases_session() {
        let backend = Arc::new(InMemoryBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let mut archive = archive(&backend, dir.path());
        archive.close();
        assert!(matches!(archive.fetch_messages(0, 1), Err(ArchiveError::SessionClosed)));
        drop(archive);
        assert!(backend.stats().balanced());
    }
}
