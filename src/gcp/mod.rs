//! Google Cloud REST adapters for the collaborator traits.

pub mod auth;
pub mod config;
pub mod datastore;
pub mod pubsub;
pub mod storage;
pub mod vision;

pub use auth::TokenSource;
pub use config::GcpConfig;
pub use datastore::DatastoreStore;
pub use pubsub::PubsubPublisher;
pub use storage::GcsObjectStore;
pub use vision::VisionClassifier;

use crate::backends::{BackendError, Backends, ImageFetcher, SearchProvider};
use reqwest::{Client, Response};
use std::sync::Arc;

/// Wires the Google Cloud adapters around the given search provider and
/// image fetcher.
pub fn backends(
    config: &GcpConfig,
    http: Client,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn ImageFetcher>,
) -> Backends {
    let tokens = TokenSource::new(http.clone(), config.access_token.clone());
    Backends {
        search,
        publisher: Arc::new(PubsubPublisher::new(
            http.clone(),
            tokens.clone(),
            &config.pubsub_url,
            &config.project,
            &config.results_topic,
        )),
        store: Arc::new(DatastoreStore::new(
            http.clone(),
            tokens.clone(),
            &config.datastore_url,
            &config.project,
            &config.advert_kind,
        )),
        fetcher,
        objects: Arc::new(GcsObjectStore::new(
            http.clone(),
            tokens.clone(),
            &config.storage_url,
            &config.image_bucket,
        )),
        classifier: Arc::new(VisionClassifier::new(http, tokens, &config.vision_url)),
    }
}

/// Turns a non-2xx response into a request error carrying the body text.
async fn check_status(response: Response, call: &str) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Request(format!(
        "{call}: HTTP {status}: {}",
        body.chars().take(200).collect::<String>()
    )))
}
