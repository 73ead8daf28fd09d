use tracing::{debug, warn};

use chatarchive_types::{ChatDataResponse, EncryptedRecord};

use crate::backend::ArchiveBackend;
use crate::error::{ArchiveError, Result};
use crate::session::Session;

/// Pages encrypted records out of a session by sequence cursor.
pub struct ChatBatchFetcher<'a, B: ArchiveBackend> {
    session: &'a Session<B>,
}

impl<'a, B: ArchiveBackend> ChatBatchFetcher<'a, B> {
    pub fn new(session: &'a Session<B>) -> Self {
        Self { session }
    }

    /// Records after `seq`, at most `limit`, in the order the archive
    /// delivered them. No retry on failure.
    pub fn fetch_batch(&self, seq: u64, limit: u32) -> Result<Vec<EncryptedRecord>> {
        if limit == 0 {
            return Err(ArchiveError::InvalidArgument("limit must be greater than zero".into()));
        }

        let body = self.session.fetch_encrypted_batch(seq, limit)?;
        let response: ChatDataResponse = serde_json::from_slice(&body)?;

        if response.errcode != 0 {
            warn!(
                "Chat data envelope reported error {}: {}",
                response.errcode, response.errmsg
            );
            return Err(ArchiveError::Fetch {
                code: response.errcode,
                message: Some(response.errmsg),
            });
        }

        debug!(
            "Batch after seq {}: {} records (limit {})",
            seq,
            response.chatdata.len(),
            limit
        );
        Ok(response.chatdata)
    }
}

/// Cursor for the page after `records`: the highest `seq` seen, or `current`
/// when the page was empty.
pub fn next_seq(current: u64, records: &[EncryptedRecord]) -> u64 {
    records.iter().map(|r| r.seq).fold(current, u64::max)
}
