use std::fmt;
use std::path::PathBuf;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};
use crate::media::DEFAULT_MAX_MEDIA_CHUNKS;

pub const DEFAULT_TIMEOUT_SECS: u32 = 10;
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Per-call transport settings handed to the backend with every request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub proxy_host: String,
    #[serde(default)]
    pub proxy_password: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
}

fn default_timeout() -> u32 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            proxy_host: String::new(),
            proxy_password: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("proxy_host", &self.proxy_host)
            .field("proxy_password", &if self.proxy_password.is_empty() { "" } else { "<redacted>" })
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Everything a driver needs to open a session and render a batch.
#[derive(Clone)]
pub struct ArchiveConfig {
    pub corp_id: String,
    pub secret: String,
    pub private_key_path: PathBuf,
    pub session: SessionOptions,
    pub page_limit: u32,
    pub start_seq: u64,
    pub media_dir: PathBuf,
    pub utc_offset_secs: i32,
    /// `None` lets a media download run until the backend says it is done.
    pub max_media_chunks: Option<u64>,
}

impl fmt::Debug for ArchiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveConfig")
            .field("corp_id", &self.corp_id)
            .field("private_key_path", &self.private_key_path)
            .field("session", &self.session)
            .field("page_limit", &self.page_limit)
            .field("start_seq", &self.start_seq)
            .field("media_dir", &self.media_dir)
            .field("utc_offset_secs", &self.utc_offset_secs)
            .field("max_media_chunks", &self.max_media_chunks)
            .finish_non_exhaustive()
    }
}

impl ArchiveConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let corp_id = required(get("CHATARCHIVE_CORP_ID"), "CHATARCHIVE_CORP_ID")?;
        let secret = required(get("CHATARCHIVE_SECRET"), "CHATARCHIVE_SECRET")?;
        let private_key_path: PathBuf =
            required(get("CHATARCHIVE_PRIVATE_KEY_PATH"), "CHATARCHIVE_PRIVATE_KEY_PATH")?.into();

        let session = SessionOptions {
            proxy_host: get("CHATARCHIVE_PROXY_HOST").unwrap_or_default(),
            proxy_password: get("CHATARCHIVE_PROXY_PASSWORD").unwrap_or_default(),
            timeout_secs: parsed(get("CHATARCHIVE_TIMEOUT_SECS"), "CHATARCHIVE_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        };

        let page_limit: u32 = parsed(get("CHATARCHIVE_PAGE_LIMIT"), "CHATARCHIVE_PAGE_LIMIT")?
            .unwrap_or(DEFAULT_PAGE_LIMIT);
        if page_limit == 0 {
            return Err(ArchiveError::Config {
                key: "CHATARCHIVE_PAGE_LIMIT".into(),
                message: "must be greater than zero".into(),
            });
        }

        let start_seq: u64 = parsed(get("CHATARCHIVE_START_SEQ"), "CHATARCHIVE_START_SEQ")?.unwrap_or(0);
        let media_dir: PathBuf = get("CHATARCHIVE_MEDIA_DIR")
            .unwrap_or_else(|| "./media".into())
            .into();
        let utc_offset_secs: i32 =
            parsed(get("CHATARCHIVE_UTC_OFFSET_SECS"), "CHATARCHIVE_UTC_OFFSET_SECS")?.unwrap_or(0);
        if FixedOffset::east_opt(utc_offset_secs).is_none() {
            return Err(ArchiveError::Config {
                key: "CHATARCHIVE_UTC_OFFSET_SECS".into(),
                message: format!("{} is not a valid UTC offset", utc_offset_secs),
            });
        }

        // 0 disables the ceiling
        let max_media_chunks =
            match parsed::<u64>(get("CHATARCHIVE_MAX_MEDIA_CHUNKS"), "CHATARCHIVE_MAX_MEDIA_CHUNKS")? {
                Some(0) => None,
                Some(n) => Some(n),
                None => Some(DEFAULT_MAX_MEDIA_CHUNKS),
            };

        Ok(Self {
            corp_id,
            secret,
            private_key_path,
            session,
            page_limit,
            start_seq,
            media_dir,
            utc_offset_secs,
            max_media_chunks,
        })
    }

    pub fn display_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_secs).ok_or_else(|| ArchiveError::Config {
            key: "utc_offset_secs".into(),
            message: format!("{} is not a valid UTC offset", self.utc_offset_secs),
        })
    }

    /// Read the PEM private key file.
    pub fn read_private_key(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.private_key_path).map_err(|e| ArchiveError::Config {
            key: "CHATARCHIVE_PRIVATE_KEY_PATH".into(),
            message: format!("cannot read {}: {}", self.private_key_path.display(), e),
        })
    }
}

fn required(value: Option<String>, key: &str) -> Result<String> {
    value.ok_or_else(|| ArchiveError::Config {
        key: key.into(),
        message: "is required".into(),
    })
}

fn parsed<T>(value: Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .map(|v| {
            v.trim().parse::<T>().map_err(|e| ArchiveError::Config {
                key: key.into(),
                message: format!("invalid value {:?}: {}", v, e),
            })
        })
        .transpose()
}
