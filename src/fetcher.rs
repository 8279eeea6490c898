//! Network side of the pipeline: probing and streaming source URLs.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use tracing::debug;

use crate::error::FetchError;

/// Body chunks of a source URL. Dropping the stream aborts the request.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, FetchError>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn probe(&self, url: &str) -> Result<SourceMetadata, FetchError>;

    async fn stream(&self, url: &str) -> Result<ByteStream, FetchError>;
}

#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("drive-relay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

fn read_metadata(headers: &HeaderMap) -> SourceMetadata {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    SourceMetadata {
        content_type,
        content_length,
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn probe(&self, url: &str) -> Result<SourceMetadata, FetchError> {
        let head = self.client.head(url).send().await?;
        if head.status().is_success() {
            return Ok(read_metadata(head.headers()));
        }

        // Some servers refuse HEAD; the headers of a GET are just as good.
        debug!("HEAD {} returned {}, retrying with GET", url, head.status());
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(read_metadata(resp.headers()))
    }

    async fn stream(&self, url: &str) -> Result<ByteStream, FetchError> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(FetchError::from));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_read_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("2048"));
        assert_eq!(
            read_metadata(&headers),
            SourceMetadata {
                content_type: Some("image/jpeg".to_string()),
                content_length: Some(2048),
            }
        );
    }

    #[test]
    fn test_read_metadata_missing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(""));
        assert_eq!(read_metadata(&headers), SourceMetadata::default());
    }
}
