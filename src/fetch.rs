//! Remote file fetching for the client's "add from URL" flow.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Url};
use thiserror::Error;

use crate::staging::{FileId, UploadItem};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Remote server responded with {0}")]
    Status(u16),
}

/// Content downloaded from a remote URL.
#[derive(Debug)]
pub struct RemoteFile {
    pub name: String,
    pub content: Bytes,
    pub content_type: Option<String>,
}

impl RemoteFile {
    /// Wrap the download as an in-memory upload, the same way an inline
    /// payload is.
    pub fn into_upload_item(self, id: FileId) -> UploadItem {
        let mime_type = self
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        UploadItem::from_bytes(id, self.name, mime_type, self.content)
    }
}

pub struct RemoteFetcher {
    client: Client,
}

impl RemoteFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<RemoteFile, FetchError> {
        let url = parse_url(url)?;
        let name = file_name_from_url(&url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content = response.bytes().await?;

        tracing::debug!(name = %name, bytes = content.len(), "Fetched remote file");
        Ok(RemoteFile {
            name,
            content,
            content_type,
        })
    }
}

/// Accept only absolute http(s) URLs with a host.
pub fn parse_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        scheme => Err(FetchError::InvalidUrl(format!(
            "unsupported URL '{raw}' (scheme {scheme})"
        ))),
    }
}

fn file_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "download".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_accepts_http() {
        assert!(parse_url("https://example.com/a.png").is_ok());
        assert!(parse_url("http://localhost:8080/").is_ok());
    }

    #[test]
    fn test_parse_url_rejects_other_input() {
        for raw in ["", "not a url", "file:///etc/passwd", "ftp://example.com/x"] {
            assert!(
                matches!(parse_url(raw), Err(FetchError::InvalidUrl(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_file_name_from_url() {
        let url = Url::parse("https://example.com/images/cat.jpg?size=2").unwrap();
        assert_eq!(file_name_from_url(&url), "cat.jpg");

        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(file_name_from_url(&url), "download");
    }
}
