use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use tracing::{debug, warn};
use uuid::Uuid;

use chatarchive_types::{DecryptedMessage, DisplayMessage, MediaTarget, MessageContent};

use crate::error::Result;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// create_new collisions with a v4 uuid mean something else is writing names
// into the directory.
const PATH_ATTEMPTS: usize = 4;

/// Second-resolution display time for a millisecond epoch.
///
/// Milliseconds are truncated, never rounded. A value chrono cannot
/// represent is shown as the raw number.
pub fn format_msgtime(msgtime_ms: i64, offset: &FixedOffset) -> String {
    let secs = msgtime_ms / 1000;
    match DateTime::from_timestamp(secs, 0) {
        Some(utc) => utc.with_timezone(offset).format(TIMESTAMP_FORMAT).to_string(),
        None => {
            warn!("msgtime {} is out of range, showing it raw", msgtime_ms);
            msgtime_ms.to_string()
        }
    }
}

/// Turns decrypted messages into what a driver prints.
#[derive(Debug, Clone)]
pub struct MessageRenderer {
    media_dir: PathBuf,
    offset: FixedOffset,
}

impl MessageRenderer {
    pub fn new(media_dir: impl Into<PathBuf>, offset: FixedOffset) -> Self {
        Self {
            media_dir: media_dir.into(),
            offset,
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Text shows its content, images a freshly reserved local path, and
    /// anything else its `msgtype` tag.
    pub fn render(&self, message: &DecryptedMessage) -> Result<DisplayMessage> {
        let (content, media) = match &message.content {
            MessageContent::Text { content } => (content.clone(), None),
            MessageContent::Image(image) => {
                let path = self.reserve_media_path("IMAGE")?;
                let target = MediaTarget {
                    sdk_file_id: image.sdkfileid.clone(),
                    path: path.clone(),
                    md5sum: image.md5sum.clone(),
                };
                (path.display().to_string(), Some(target))
            }
            MessageContent::Other { msgtype } => (msgtype.clone(), None),
        };

        Ok(DisplayMessage {
            seq: message.seq,
            msgid: message.msgid.clone(),
            timestamp: format_msgtime(message.msgtime, &self.offset),
            content,
            media,
        })
    }

    /// Create an empty file with a unique name under the media directory.
    fn reserve_media_path(&self, prefix: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.media_dir)?;

        for _ in 0..PATH_ATTEMPTS {
            let path = self.media_dir.join(format!("{}_{}", prefix, Uuid::new_v4()));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!("Reserved media path {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free media file name in {}", self.media_dir.display()),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatarchive_types::ImageBody;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn message(content: MessageContent) -> DecryptedMessage {
        DecryptedMessage {
            seq: 7,
            msgid: "m7".into(),
            action: Some("send".into()),
            from: Some("alice".into()),
            tolist: vec!["bob".into()],
            roomid: None,
            msgtime: 1_700_000_000_123,
            content,
        }
    }

    #[test]
    fn milliseconds_are_truncated() {
        let a = format_msgtime(1_700_000_000_123, &utc());
        let b = format_msgtime(1_700_000_000_999, &utc());
        assert_eq!(a, b);
        assert_eq!(a, "2023-11-14 22:13:20");
    }

    #[test]
    fn offset_shifts_display_time() {
        let cst = FixedOffset::east_opt(8 * 3600).unwrap();
        assert_eq!(format_msgtime(1_700_000_000_000, &cst), "2023-11-15 06:13:20");
    }

    #[test]
    fn out_of_range_time_is_shown_raw() {
        assert_eq!(format_msgtime(i64::MAX, &utc()), i64::MAX.to_string());
    }

    #[test]
    fn text_renders_content() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = MessageRenderer::new(dir.path(), utc());
        let shown = renderer
            .render(&message(MessageContent::Text { content: "hello".into() }))
            .unwrap();
        assert_eq!(shown.content, "hello");
        assert_eq!(shown.seq, 7);
        assert!(shown.media.is_none());
    }

    #[test]
    fn unknown_type_renders_its_tag() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = MessageRenderer::new(dir.path(), utc());
        let shown = renderer
            .render(&message(MessageContent::Other { msgtype: "sticker".into() }))
            .unwrap();
        assert_eq!(shown.content, "sticker");
        assert!(shown.media.is_none());
    }

    #[test]
    fn images_get_distinct_reserved_paths() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");
        let renderer = MessageRenderer::new(&media_dir, utc());
        let image = message(MessageContent::Image(ImageBody {
            sdkfileid: "file-1".into(),
            md5sum: Some("abc".into()),
            filesize: Some(10),
        }));

        let first = renderer.render(&image).unwrap();
        let second = renderer.render(&image).unwrap();

        let target = first.media.unwrap();
        assert_eq!(target.sdk_file_id, "file-1");
        assert_eq!(target.md5sum.as_deref(), Some("abc"));
        assert_eq!(first.content, target.path.display().to_string());
        assert!(target.path.exists());
        assert!(target
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("IMAGE_"));
        assert_ne!(first.content, second.content);
    }
}
