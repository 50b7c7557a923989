use crate::advert::{RawItem, RecordIdentity, StoredAdvert};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

/// Image bytes as downloaded from the provider.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Location of an object written to the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub bucket: String,
    pub name: String,
}

impl StoredObject {
    pub fn gcs_uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.name)
    }
}

impl fmt::Display for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub label: String,
    pub score: f64,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, keywords: &str) -> Result<Vec<RawItem>, BackendError>;
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes one message and returns the transport's message id.
    async fn publish(&self, payload: Vec<u8>) -> Result<String, BackendError>;
}

#[async_trait]
pub trait AdvertStore: Send + Sync {
    /// One atomic upsert of the whole record.
    async fn put(&self, advert: &StoredAdvert) -> Result<(), BackendError>;
    async fn get(&self, id: &RecordIdentity) -> Result<Option<StoredAdvert>, BackendError>;
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, BackendError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<StoredObject, BackendError>;
}

#[async_trait]
pub trait ImageClassifier: Send + Sync {
    async fn detect_labels(&self, image: &StoredObject) -> Result<Vec<Annotation>, BackendError>;
    async fn detect_logos(&self, image: &StoredObject) -> Result<Vec<Annotation>, BackendError>;
}

/// One implementation of every collaborator the pipelines need.
#[derive(Clone)]
pub struct Backends {
    pub search: Arc<dyn SearchProvider>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub store: Arc<dyn AdvertStore>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub objects: Arc<dyn ObjectStore>,
    pub classifier: Arc<dyn ImageClassifier>,
}
