//! HTTP media source.
//!
//! Handles links that point straight at a media file: `inspect` reads the
//! response headers, `fetch` streams the body into the temp directory with a
//! hard size cap.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Response, Url};
use tokio::io::AsyncWriteExt;

use dlbot_core::{
    errors::Error,
    formatting::format_file_size,
    media::{sanitize_filename, MediaFile, MediaInfo, MediaSource, Platform, QualityOption},
    Result,
};

const USER_AGENT: &str = concat!("dlbot/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
pub struct HttpMediaSource {
    http: reqwest::Client,
}

impl HttpMediaSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("http client build: {e}")))?;
        Ok(Self { http })
    }

    async fn head_or_get(&self, url: &str) -> Result<Response> {
        let resp = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|e| Error::External(format!("http request error: {e}")))?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        // Some servers refuse HEAD; the body of a GET is dropped unread.
        tracing::debug!(status = %resp.status(), url, "HEAD refused, retrying with GET");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::External(format!("http request error: {e}")))?;
        check_status(resp)
    }
}

fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(Error::External(format!("http status {status}")))
    }
}

fn content_type(resp: &Response) -> String {
    resp.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn is_media_type(content_type: &str) -> bool {
    content_type.starts_with("video/")
        || content_type.starts_with("audio/")
        || content_type == "application/octet-stream"
}

/// Last path segment without its extension, if there is one.
fn title_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let stem = last.rsplit_once('.').map(|(s, _)| s).unwrap_or(last);
    let title = stem.replace(['_', '-', '+'], " ").trim().to_string();
    (!title.is_empty()).then_some(title)
}

/// File extension from the content type, falling back to the URL.
fn extension_for(content_type: &str, url: &str) -> String {
    let from_type = match content_type {
        "video/mp4" => Some("mp4"),
        "video/webm" | "audio/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        "video/x-matroska" => Some("mkv"),
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" => Some("m4a"),
        "audio/ogg" => Some("ogg"),
        _ => None,
    };
    if let Some(ext) = from_type {
        return ext.to_string();
    }

    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .and_then(|last| last.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "mp4".to_string())
}

fn original_quality(ext: &str, size: u64) -> QualityOption {
    QualityOption {
        label: "original".to_string(),
        format: ext.to_string(),
        size,
    }
}

/// Remove a partial download. Missing files are fine.
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "partial download not removed");
        }
    }
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn inspect(&self, url: &str) -> Result<MediaInfo> {
        let platform = Platform::detect(url);
        let resp = self.head_or_get(url).await?;
        let ctype = content_type(&resp);
        if !is_media_type(&ctype) {
            return Err(Error::External(format!(
                "no downloadable media at this link ({})",
                if ctype.is_empty() { "unknown type" } else { &ctype }
            )));
        }

        let size = resp.content_length().unwrap_or(0);
        let ext = extension_for(&ctype, url);
        let title = title_from_url(url).unwrap_or_else(|| format!("Video from {}", platform.as_str()));
        tracing::debug!(url, content_type = %ctype, size, "inspected");

        Ok(MediaInfo {
            title,
            platform,
            duration: None,
            qualities: vec![original_quality(&ext, size)],
            direct_url: Some(resp.url().to_string()),
        })
    }

    async fn fetch(
        &self,
        url: &str,
        quality: &str,
        dest_dir: &Path,
        max_bytes: u64,
    ) -> Result<MediaFile> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::External(format!("http request error: {e}")))?;
        let mut resp = check_status(resp)?;

        if let Some(len) = resp.content_length() {
            if len > max_bytes {
                return Err(Error::InvalidInput(format!(
                    "file is {} (limit {})",
                    format_file_size(len),
                    format_file_size(max_bytes)
                )));
            }
        }

        let ctype = content_type(&resp);
        let ext = extension_for(&ctype, url);
        let title = title_from_url(url).unwrap_or_else(|| "download".to_string());
        let file_name = format!(
            "{}_{}.{ext}",
            Utc::now().timestamp_millis(),
            sanitize_filename(&title)
        );
        tokio::fs::create_dir_all(dest_dir).await?;
        let path: PathBuf = dest_dir.join(&file_name);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut written: u64 = 0;
        loop {
            let chunk = match resp.chunk().await {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    discard(&path).await;
                    return Err(Error::External(format!("http body error: {e}")));
                }
            };
            written += chunk.len() as u64;
            if written > max_bytes {
                drop(file);
                discard(&path).await;
                return Err(Error::InvalidInput(format!(
                    "file exceeds the {} limit",
                    format_file_size(max_bytes)
                )));
            }
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                discard(&path).await;
                return Err(e.into());
            }
        }
        file.flush().await?;

        tracing::info!(url, quality, bytes = written, file = %file_name, "media fetched");
        Ok(MediaFile {
            path,
            file_name,
            title,
            size: written,
        })
    }
}
