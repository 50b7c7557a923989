use crate::backends::BackendError;
use reqwest::Client;
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::debug;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// Tokens are refreshed this long before the metadata server says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Bearer tokens for Google APIs: a fixed token when one is configured,
/// otherwise the instance service account via the metadata server.
#[derive(Clone)]
pub struct TokenSource {
    http: Client,
    fixed: Option<String>,
    cached: Arc<Mutex<Option<CachedToken>>>,
}

impl TokenSource {
    pub fn new(http: Client, fixed: Option<String>) -> Self {
        Self {
            http,
            fixed,
            cached: Arc::default(),
        }
    }

    pub async fn token(&self) -> Result<String, BackendError> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }
        let mut guard = self.cached.lock().await;
        if let Some(cached) = guard.as_ref()
            && Instant::now() < cached.refresh_at
        {
            return Ok(cached.value.clone());
        }

        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| BackendError::Request(format!("metadata token: {err}")))?;
        if !response.status().is_success() {
            return Err(BackendError::Request(format!(
                "metadata token: HTTP {}",
                response.status()
            )));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        debug!(target = "harvest.gcp", expires_in = token.expires_in, "access_token_refreshed");
        *guard = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}
