use std::fmt;

/// Resume handle for a chunked media fetch.
///
/// The archive hands this back with every chunk and expects it verbatim on
/// the next request. It is not an offset and supports no arithmetic.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    /// The token for the first request of a download (empty).
    pub fn initial() -> Self {
        Self(Vec::new())
    }

    /// Wrap a token exactly as the backend returned it.
    pub fn from_service(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_initial(&self) -> bool {
        self.0.is_empty()
    }
}

// Contents are not printed: the token is a capability, not diagnostics.
impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContinuationToken({} bytes)", self.0.len())
    }
}

/// Where a media download currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFetchState {
    pub sdk_file_id: String,
    pub continuation: ContinuationToken,
    pub is_finished: bool,
}

impl MediaFetchState {
    pub fn start(sdk_file_id: impl Into<String>) -> Self {
        Self {
            sdk_file_id: sdk_file_id.into(),
            continuation: ContinuationToken::initial(),
            is_finished: false,
        }
    }
}

/// One step of a media download: the bytes received and the state to resume from.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub data: Vec<u8>,
    pub next: MediaFetchState,
}
