use super::{
    DecodeError, PipelineError, StageOutcome, capture_stage, decode_message,
};
use crate::advert::{
    ImageReference, ImageReferenceResolver, KeyPathUnpacker, RawItem, RecordIdentity,
    StoredAdvert,
};
use crate::advert::unpack::FINDING_KEY_PATHS;
use crate::backends::{AdvertStore, Backends, ImageFetcher, ObjectStore, StoredObject};
use crate::ebay::finding::{FINDING_RESPONSE_KEY, items_from_response};
use crate::models::{PubsubMessage, RunReport, StageReport};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Turns one inbound item message into a stored advert and, when the item
/// has a recoverable gallery image, an image object named after the advert.
#[derive(Clone)]
pub struct IngestionPipeline {
    unpacker: KeyPathUnpacker,
    resolver: ImageReferenceResolver,
    store: Arc<dyn AdvertStore>,
    fetcher: Arc<dyn ImageFetcher>,
    objects: Arc<dyn ObjectStore>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Skipped { reason: String },
    Stored { adverts: Vec<IngestedAdvert> },
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedAdvert {
    pub id: RecordIdentity,
    pub item_id: Option<String>,
    pub image: ImageCapture,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ImageCapture {
    Unavailable,
    Stored { object: StoredObject },
    Failed { url: String, error: String },
}

impl IngestionPipeline {
    pub fn new(backends: &Backends, resolver: ImageReferenceResolver) -> Self {
        Self {
            unpacker: KeyPathUnpacker::new(FINDING_KEY_PATHS),
            resolver,
            store: backends.store.clone(),
            fetcher: backends.fetcher.clone(),
            objects: backends.objects.clone(),
        }
    }

    pub async fn run(
        &self,
        message: &PubsubMessage,
    ) -> Result<RunReport<IngestOutcome>, PipelineError> {
        let trigger = message.trigger_id();
        let mut stages = Vec::new();

        let decoded = capture_stage("decode", &mut stages, async {
            let decoded = decode_items(message.data.as_deref(), &trigger);
            let output = match &decoded {
                Ok(items) => json!({ "items": items.len() }),
                Err(reason) => json!({ "skipped": reason }),
            };
            Ok(StageOutcome::new(decoded, output))
        })
        .await?;

        let items = match decoded {
            Ok(items) if !items.is_empty() => items,
            Ok(_) => {
                warn!(target = "harvest.ingest", %trigger, "payload_without_items");
                return Ok(RunReport {
                    trigger,
                    outcome: IngestOutcome::Skipped {
                        reason: "payload contained no items".into(),
                    },
                    stages,
                });
            }
            Err(reason) => {
                return Ok(RunReport {
                    trigger,
                    outcome: IngestOutcome::Skipped { reason },
                    stages,
                });
            }
        };

        let mut adverts = Vec::with_capacity(items.len());
        for item in items {
            adverts.push(self.ingest_item(item, &mut stages).await?);
        }

        Ok(RunReport {
            trigger,
            outcome: IngestOutcome::Stored { adverts },
            stages,
        })
    }

    async fn ingest_item(
        &self,
        item: RawItem,
        stages: &mut Vec<StageReport>,
    ) -> Result<IngestedAdvert, PipelineError> {
        let record = capture_stage("normalize", stages, async {
            let flat = self.unpacker.unpack(&item);
            let output = json!({
                "fields": flat.len(),
                "price": flat.get("price"),
                "currency": flat.get("currency"),
                "seller": flat.get("sellerUserName"),
            });
            Ok(StageOutcome::new(flat, output))
        })
        .await?;

        let id = capture_stage("identify", stages, async {
            let id = RecordIdentity::generate();
            Ok(StageOutcome::new(id, json!({ "id": id })))
        })
        .await?;

        let image = capture_stage("resolve_image", stages, async {
            let reference = self.resolver.resolve(&item);
            let output = json!({
                "available": reference.is_some(),
                "item_id": reference.as_ref().map(|r| r.item_id.as_str()),
                "url": reference.as_ref().map(|r| r.url.as_str()),
            });
            Ok(StageOutcome::new(reference, output))
        })
        .await?;

        let item_id = record.get("itemId").cloned();
        let advert = StoredAdvert::new(id, record, Utc::now());
        capture_stage("persist", stages, async {
            self.store
                .put(&advert)
                .await
                .map_err(|err| PipelineError::downstream("persist", err))?;
            Ok(StageOutcome::new(
                (),
                json!({ "id": id, "fields": advert.fields.len() }),
            ))
        })
        .await?;
        info!(target = "harvest.ingest", %id, item_id = item_id.as_deref().unwrap_or("-"), "advert_stored");

        // The record is committed before the image write, so the object
        // event that triggers enrichment can only fire for an existing record.
        let image = match image {
            Some(reference) => {
                capture_stage("capture_image", stages, async {
                    let capture = self.capture_image(&id, &reference).await;
                    let output = json!({ "source": reference.url, "capture": capture });
                    Ok(StageOutcome::new(capture, output))
                })
                .await?
            }
            None => ImageCapture::Unavailable,
        };

        Ok(IngestedAdvert {
            id,
            item_id,
            image,
        })
    }

    /// Best effort: failures are logged and reported, never propagated.
    async fn capture_image(&self, id: &RecordIdentity, reference: &ImageReference) -> ImageCapture {
        let failed = |error: String| ImageCapture::Failed {
            url: reference.url.clone(),
            error,
        };
        let fetched = match self.fetcher.fetch(&reference.url).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(target = "harvest.ingest", %id, url = %reference.url, error = %err, "image_fetch_failed");
                return failed(err.to_string());
            }
        };
        let content_type = fetched
            .content_type
            .as_deref()
            .unwrap_or(DEFAULT_IMAGE_CONTENT_TYPE);
        match self
            .objects
            .put_object(&id.to_string(), Some(content_type), fetched.bytes)
            .await
        {
            Ok(object) => ImageCapture::Stored { object },
            Err(err) => {
                warn!(target = "harvest.ingest", %id, error = %err, "image_upload_failed");
                failed(err.to_string())
            }
        }
    }
}

/// Accepts a single item or the legacy whole-response envelope.
fn decode_items(data: Option<&str>, trigger: &str) -> Result<Vec<RawItem>, String> {
    match decode_message(data) {
        Ok(Value::Object(doc)) if doc.contains_key(FINDING_RESPONSE_KEY) => {
            items_from_response(&Value::Object(doc)).map_err(|err| {
                error!(target = "harvest.ingest", %trigger, error = %err, "search_response_rejected");
                err.to_string()
            })
        }
        Ok(Value::Object(item)) => Ok(vec![item]),
        Ok(_) => {
            error!(target = "harvest.ingest", %trigger, "payload_not_an_object");
            Err("payload is not a json object".into())
        }
        Err(DecodeError::Missing) => {
            warn!(target = "harvest.ingest", %trigger, "no data in message");
            Err(DecodeError::Missing.to_string())
        }
        Err(err) => {
            error!(target = "harvest.ingest", %trigger, error = %err, "undecodable_message");
            Err(err.to_string())
        }
    }
}
