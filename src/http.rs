use crate::backends::{BackendError, FetchedImage, ImageFetcher};
use async_trait::async_trait;
use reqwest::{Client, header::CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(15);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Downloads listing images over plain HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    http: Client,
}

impl HttpImageFetcher {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new(build_client())
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, BackendError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| BackendError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Request(format!("HTTP {status} fetching {url}")));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| BackendError::Request(err.to_string()))?;
        debug!(target = "harvest.api", %url, bytes = bytes.len(), "image_fetched");
        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
