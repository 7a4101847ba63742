//! Media source port plus the pieces of media handling that live in core:
//! platform detection, URL validation and the temp-dir janitor.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Instagram,
    TikTok,
    Facebook,
    Twitter,
    Unknown,
}

impl Platform {
    pub fn detect(url: &str) -> Self {
        let u = url.to_ascii_lowercase();
        if u.contains("youtube.com") || u.contains("youtu.be") {
            Platform::YouTube
        } else if u.contains("instagram.com") {
            Platform::Instagram
        } else if u.contains("tiktok.com") {
            Platform::TikTok
        } else if u.contains("facebook.com") || u.contains("fb.watch") {
            Platform::Facebook
        } else if u.contains("twitter.com") || u.contains("x.com") {
            Platform::Twitter
        } else {
            Platform::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
            Platform::Facebook => "facebook",
            Platform::Twitter => "twitter",
            Platform::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualityOption {
    pub label: String,
    /// Container, e.g. `mp4`.
    pub format: String,
    /// Bytes; 0 when unknown.
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaInfo {
    pub title: String,
    pub platform: Platform,
    pub duration: Option<String>,
    /// Best first.
    pub qualities: Vec<QualityOption>,
    /// Link handed out for the "link" delivery format.
    pub direct_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaFile {
    pub path: PathBuf,
    pub file_name: String,
    pub title: String,
    pub size: u64,
}

impl MediaFile {
    /// Extension of the stored file, used as the record's format.
    pub fn extension(&self) -> String {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string()
    }
}

/// Metadata + byte-stream capability for a media URL.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn inspect(&self, url: &str) -> Result<MediaInfo>;

    /// Download into `dest_dir`. Implementations must give up once more
    /// than `max_bytes` arrived and remove the partial file.
    async fn fetch(
        &self,
        url: &str,
        quality: &str,
        dest_dir: &Path,
        max_bytes: u64,
    ) -> Result<MediaFile>;
}

fn url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://[^\s/?#.][^\s/?#]*(?:[/?#]\S*)?$").ok())
        .as_ref()
}

/// Absolute http(s) URL with a host and no whitespace.
pub fn is_valid_url(text: &str) -> bool {
    url_regex().is_some_and(|re| re.is_match(text.trim()))
}

/// Lowercase ASCII alphanumerics, everything else `_`, at most 50 chars.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .take(50)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

// ============== Temp-dir janitor ==============

/// Delete regular files in `dir` whose mtime is more than `max_age` ago.
/// Returns the number deleted. Entries that vanish or cannot be stat'ed are
/// skipped.
pub async fn cleanup_old_files(dir: &Path, max_age: Duration) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut deleted = 0;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(md) = entry.metadata().await else {
            continue;
        };
        if !md.is_file() {
            continue;
        }
        let Ok(modified) = md.modified() else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > max_age && tokio::fs::remove_file(entry.path()).await.is_ok() {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Run `cleanup_old_files` every `every` until `cancel` fires.
pub fn spawn_janitor(
    dir: PathBuf,
    max_age: Duration,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    match cleanup_old_files(&dir, max_age).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(deleted = n, dir = %dir.display(), "temp cleanup"),
                        Err(e) => tracing::warn!(error = %e, "temp cleanup failed"),
                    }
                }
            }
        }
    })
}
