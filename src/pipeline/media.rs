//! Media fetching
//!
//! Downloads attachment bytes through the protocol client with bounded
//! retries, then stores them under the media directory with a
//! collision-proof filename. A failed download degrades gracefully: the
//! caller records the message without attachment bytes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::protocol::{MediaRef, ProtocolClient};
use crate::{Error, Result, retry};

/// Maximum download attempts before giving up
const MAX_ATTEMPTS: u32 = 10;

/// Backoff step: attempt N sleeps N * 2s
const BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Length of the random filename token
const TOKEN_LEN: usize = 5;

/// A downloaded attachment persisted to disk
#[derive(Debug, Clone)]
pub struct StoredMedia {
    /// Unique stored filename
    pub filename: String,
    /// MIME type
    pub mime_type: String,
    /// Absolute path of the stored file
    pub path: PathBuf,
}

/// Downloads and stores message attachments
#[derive(Clone)]
pub struct MediaFetcher {
    media_dir: PathBuf,
}

impl MediaFetcher {
    /// Create a fetcher storing files under `media_dir`
    #[must_use]
    pub const fn new(media_dir: PathBuf) -> Self {
        Self { media_dir }
    }

    /// Download an attachment and persist it
    ///
    /// Retries up to 10 attempts with linearly increasing backoff.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MediaDownload`] when every attempt fails, or an IO
    /// error when the payload cannot be written.
    pub async fn fetch(
        &self,
        client: &Arc<dyn ProtocolClient>,
        media: &MediaRef,
        filename_hint: Option<&str>,
    ) -> Result<StoredMedia> {
        let payload = retry::with_backoff(MAX_ATTEMPTS, retry::linear(BACKOFF_STEP), || {
            client.download_attachment(media)
        })
        .await
        .map_err(|e| Error::MediaDownload(format!("{} ({e})", media.media_id)))?;

        let base = payload
            .filename
            .as_deref()
            .or(filename_hint);
        let filename = unique_filename(base, &payload.mime_type);

        tokio::fs::create_dir_all(&self.media_dir).await?;
        let path = self.media_dir.join(&filename);
        tokio::fs::write(&path, &payload.bytes).await?;

        tracing::debug!(
            media_id = %media.media_id,
            file = %filename,
            bytes = payload.bytes.len(),
            "attachment stored"
        );

        Ok(StoredMedia {
            filename,
            mime_type: payload.mime_type,
            path,
        })
    }
}

/// Build a collision-proof filename: a short random token plus a timestamp
/// keeps re-sent documents from clobbering each other.
fn unique_filename(base: Option<&str>, mime_type: &str) -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect();
    let stamp = chrono::Utc::now().timestamp_millis();

    base.map_or_else(
        || format!("{stamp}-{token}.{}", extension_for(mime_type)),
        |name| {
            // Strip any path components a malicious sender might smuggle in
            let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
            match name.rsplit_once('.') {
                Some((stem, ext)) => format!("{stem}-{token}-{stamp}.{ext}"),
                None => format!("{name}-{token}-{stamp}"),
            }
        },
    )
}

fn extension_for(mime_type: &str) -> String {
    mime_type
        .split('/')
        .nth(1)
        .unwrap_or("bin")
        .split(';')
        .next()
        .unwrap_or("bin")
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::protocol::{
        ChatAddress, GroupMetadata, MediaPayload, MenuEntry, MessageKey, OutboundMedia, RawMessage,
    };

    /// Client whose downloads fail `failures` times before succeeding
    struct FlakyMediaClient {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProtocolClient for FlakyMediaClient {
        async fn send_text(&self, _to: &ChatAddress, _body: &str) -> Result<RawMessage> {
            Err(Error::Protocol("not supported in this test".to_string()))
        }

        async fn send_buttons(
            &self,
            _to: &ChatAddress,
            _body: &str,
            _buttons: &[MenuEntry],
        ) -> Result<RawMessage> {
            Err(Error::Protocol("not supported in this test".to_string()))
        }

        async fn send_list(
            &self,
            _to: &ChatAddress,
            _body: &str,
            _button: &str,
            _entries: &[MenuEntry],
        ) -> Result<RawMessage> {
            Err(Error::Protocol("not supported in this test".to_string()))
        }

        async fn send_media(
            &self,
            _to: &ChatAddress,
            _media: &OutboundMedia,
        ) -> Result<RawMessage> {
            Err(Error::Protocol("not supported in this test".to_string()))
        }

        async fn download_attachment(&self, media: &MediaRef) -> Result<MediaPayload> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(Error::Protocol("stream broken".to_string()));
            }
            Ok(MediaPayload {
                bytes: b"payload".to_vec(),
                mime_type: media.mime_type.clone(),
                filename: None,
            })
        }

        async fn read_receipts(&self, _keys: &[MessageKey]) -> Result<()> {
            Ok(())
        }

        async fn group_metadata(&self, _chat: &ChatAddress) -> Result<GroupMetadata> {
            Err(Error::Protocol("not supported in this test".to_string()))
        }

        async fn reject_call(&self, _call_id: &str) -> Result<()> {
            Ok(())
        }

        async fn logout(&self) -> Result<()> {
            Ok(())
        }
    }

    fn media_ref() -> MediaRef {
        MediaRef {
            media_id: "media-1".to_string(),
            mime_type: "image/png".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn download_survives_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MediaFetcher::new(dir.path().to_path_buf());
        let client: Arc<dyn ProtocolClient> = Arc::new(FlakyMediaClient {
            failures: 3,
            calls: AtomicU32::new(0),
        });

        let stored = fetcher.fetch(&client, &media_ref(), None).await.unwrap();
        assert!(stored.path.exists());
        assert!(stored.filename.ends_with(".png"));
        assert_eq!(stored.mime_type, "image/png");
    }

    #[tokio::test(start_paused = true)]
    async fn download_gives_up_after_ten_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MediaFetcher::new(dir.path().to_path_buf());
        let client = Arc::new(FlakyMediaClient {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let dyn_client: Arc<dyn ProtocolClient> = client.clone();

        let err = fetcher.fetch(&dyn_client, &media_ref(), None).await.unwrap_err();
        assert!(matches!(err, Error::MediaDownload(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn filenames_never_collide() {
        let a = unique_filename(Some("report.pdf"), "application/pdf");
        let b = unique_filename(Some("report.pdf"), "application/pdf");
        assert_ne!(a, b);
        assert!(a.starts_with("report-"));
        assert!(a.ends_with(".pdf"));
    }

    #[test]
    fn filename_falls_back_to_mime_extension() {
        let name = unique_filename(None, "audio/ogg; codecs=opus");
        assert!(name.ends_with(".ogg"));
    }

    #[test]
    fn path_components_are_stripped() {
        let name = unique_filename(Some("../../etc/passwd"), "application/octet-stream");
        assert!(!name.contains('/'));
        assert!(name.starts_with("passwd"));
    }
}
