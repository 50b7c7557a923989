//! In-process collaborators for local runs and tests.
//!
//! When wired to a [`LocalBus`], the publisher and object store forward the
//! events a real transport would deliver.

// inspection helpers are only read by tests
#![cfg_attr(not(test), allow(dead_code))]

use crate::advert::{RawItem, RecordIdentity, StoredAdvert};
use crate::backends::{
    AdvertStore, Annotation, BackendError, Backends, FetchedImage, ImageClassifier, ImageFetcher,
    MessagePublisher, ObjectStore, SearchProvider, StoredObject,
};
use crate::bus::{BusEvent, LocalBus};
use crate::pipeline::ObjectEvent;
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub const MEMORY_BUCKET: &str = "memory-bucket";

#[derive(Clone, Default)]
pub struct InMemoryAdvertStore {
    records: Arc<RwLock<HashMap<RecordIdentity, StoredAdvert>>>,
    writes: Arc<Mutex<usize>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl InMemoryAdvertStore {
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn writes(&self) -> usize {
        *self.writes.lock().await
    }

    pub async fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().await = fail;
    }

    pub async fn snapshot(&self) -> Vec<StoredAdvert> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl AdvertStore for InMemoryAdvertStore {
    async fn put(&self, advert: &StoredAdvert) -> Result<(), BackendError> {
        if *self.fail_writes.lock().await {
            return Err(BackendError::Request("store unavailable".into()));
        }
        self.records.write().await.insert(advert.id, advert.clone());
        *self.writes.lock().await += 1;
        Ok(())
    }

    async fn get(&self, id: &RecordIdentity) -> Result<Option<StoredAdvert>, BackendError> {
        Ok(self.records.read().await.get(id).cloned())
    }
}

#[derive(Clone)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    notify: Option<LocalBus>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>, notify: Option<LocalBus>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::default(),
            notify,
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.objects.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(
        &self,
        name: &str,
        _content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<StoredObject, BackendError> {
        self.objects.write().await.insert(name.to_string(), bytes);
        let object = StoredObject {
            bucket: self.bucket.clone(),
            name: name.to_string(),
        };
        if let Some(bus) = &self.notify {
            bus.emit(BusEvent::ObjectFinalized(ObjectEvent::finalized(&object)));
        }
        Ok(object)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPublisher {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    forward: Option<LocalBus>,
}

impl InMemoryPublisher {
    pub fn new(forward: Option<LocalBus>) -> Self {
        Self {
            sent: Arc::default(),
            forward,
        }
    }

    pub async fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<String, BackendError> {
        let message_id = Uuid::new_v4().simple().to_string();
        self.sent.lock().await.push(payload.clone());
        if let Some(bus) = &self.forward {
            bus.emit(BusEvent::AdvertPublished {
                message_id: message_id.clone(),
                payload,
            });
        }
        Ok(message_id)
    }
}

/// Returns a canned item list and records the keywords it was asked for.
#[derive(Clone, Default)]
pub struct StaticSearchProvider {
    items: Arc<Mutex<Vec<RawItem>>>,
    calls: Arc<Mutex<Vec<String>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl StaticSearchProvider {
    pub async fn respond(&self, items: Vec<Value>) {
        *self.items.lock().await = items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
    }

    pub async fn fail_with(&self, message: &str) {
        *self.failure.lock().await = Some(message.to_string());
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SearchProvider for StaticSearchProvider {
    async fn search(&self, keywords: &str) -> Result<Vec<RawItem>, BackendError> {
        self.calls.lock().await.push(keywords.to_string());
        if let Some(message) = self.failure.lock().await.clone() {
            return Err(BackendError::Request(message));
        }
        Ok(self.items.lock().await.clone())
    }
}

#[derive(Clone, Default)]
pub struct StaticImageFetcher {
    requested: Arc<Mutex<Vec<String>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl StaticImageFetcher {
    pub async fn fail_with(&self, message: &str) {
        *self.failure.lock().await = Some(message.to_string());
    }

    pub async fn requested(&self) -> Vec<String> {
        self.requested.lock().await.clone()
    }
}

#[async_trait]
impl ImageFetcher for StaticImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, BackendError> {
        self.requested.lock().await.push(url.to_string());
        if let Some(message) = self.failure.lock().await.clone() {
            return Err(BackendError::Request(message));
        }
        Ok(FetchedImage {
            bytes: url.as_bytes().to_vec(),
            content_type: Some("image/jpeg".into()),
        })
    }
}

#[derive(Clone, Default)]
pub struct StaticClassifier {
    labels: Arc<Mutex<Vec<Annotation>>>,
    logos: Arc<Mutex<Vec<Annotation>>>,
    failure: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<usize>>,
}

impl StaticClassifier {
    pub async fn respond(&self, labels: Vec<Annotation>, logos: Vec<Annotation>) {
        *self.labels.lock().await = labels;
        *self.logos.lock().await = logos;
    }

    pub async fn fail_with(&self, message: &str) {
        *self.failure.lock().await = Some(message.to_string());
    }

    pub async fn calls(&self) -> usize {
        *self.calls.lock().await
    }

    async fn answer(&self, source: &Mutex<Vec<Annotation>>) -> Result<Vec<Annotation>, BackendError> {
        *self.calls.lock().await += 1;
        if let Some(message) = self.failure.lock().await.clone() {
            return Err(BackendError::Request(message));
        }
        Ok(source.lock().await.clone())
    }
}

#[async_trait]
impl ImageClassifier for StaticClassifier {
    async fn detect_labels(&self, _image: &StoredObject) -> Result<Vec<Annotation>, BackendError> {
        self.answer(&self.labels).await
    }

    async fn detect_logos(&self, _image: &StoredObject) -> Result<Vec<Annotation>, BackendError> {
        self.answer(&self.logos).await
    }
}

/// Concrete handles to every in-memory collaborator, so tests can inspect
/// them after a run.
#[derive(Clone)]
pub struct MemoryBackends {
    pub search: StaticSearchProvider,
    pub publisher: InMemoryPublisher,
    pub store: InMemoryAdvertStore,
    pub fetcher: StaticImageFetcher,
    pub objects: InMemoryObjectStore,
    pub classifier: StaticClassifier,
}

impl Default for MemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackends {
    pub fn new() -> Self {
        Self::with_bus(None)
    }

    pub fn with_bus(bus: Option<LocalBus>) -> Self {
        Self {
            search: StaticSearchProvider::default(),
            publisher: InMemoryPublisher::new(bus.clone()),
            store: InMemoryAdvertStore::default(),
            fetcher: StaticImageFetcher::default(),
            objects: InMemoryObjectStore::new(MEMORY_BUCKET, bus),
            classifier: StaticClassifier::default(),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            search: Arc::new(self.search.clone()),
            publisher: Arc::new(self.publisher.clone()),
            store: Arc::new(self.store.clone()),
            fetcher: Arc::new(self.fetcher.clone()),
            objects: Arc::new(self.objects.clone()),
            classifier: Arc::new(self.classifier.clone()),
        }
    }
}
