use super::{PipelineError, StageOutcome, capture_stage, decode_message};
use crate::advert::{LabelScores, RecordIdentity};
use crate::backends::{AdvertStore, Annotation, Backends, ImageClassifier, StoredObject};
use crate::models::{PubsubMessage, RunReport};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.80;
pub const OBJECT_FINALIZE: &str = "OBJECT_FINALIZE";

/// "An object became available" notification from the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEvent {
    pub bucket: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl ObjectEvent {
    pub fn finalized(object: &StoredObject) -> Self {
        Self {
            bucket: object.bucket.clone(),
            name: object.name.clone(),
            event_type: Some(OBJECT_FINALIZE.into()),
        }
    }

    /// Reads a storage notification delivered over Pub/Sub: attributes
    /// first, then the object resource carried in the data.
    pub fn from_message(message: &PubsubMessage) -> Option<Self> {
        let event_type = message.attributes.get("eventType").cloned();
        if let (Some(bucket), Some(name)) = (
            message.attributes.get("bucketId"),
            message.attributes.get("objectId"),
        ) {
            return Some(Self {
                bucket: bucket.clone(),
                name: name.clone(),
                event_type,
            });
        }
        let resource = decode_message(message.data.as_deref()).ok()?;
        Some(Self {
            bucket: resource.get("bucket")?.as_str()?.to_string(),
            name: resource.get("name")?.as_str()?.to_string(),
            event_type,
        })
    }
}

/// Attaches confident classifier labels to the advert named by an image.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    classifier: Arc<dyn ImageClassifier>,
    store: Arc<dyn AdvertStore>,
    min_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrichOutcome {
    Ignored { reason: String },
    NoLabels,
    Enriched { id: RecordIdentity, labels: LabelScores },
}

impl EnrichmentPipeline {
    pub fn new(backends: &Backends, min_confidence: f64) -> Self {
        Self {
            classifier: backends.classifier.clone(),
            store: backends.store.clone(),
            min_confidence,
        }
    }

    pub async fn run(
        &self,
        trigger: String,
        event: ObjectEvent,
    ) -> Result<RunReport<EnrichOutcome>, PipelineError> {
        let mut stages = Vec::new();

        if let Some(kind) = event.event_type.as_deref().filter(|k| *k != OBJECT_FINALIZE) {
            debug!(target = "harvest.enrich", %trigger, event_type = kind, "event_ignored");
            return Ok(ignored(trigger, format!("event type {kind}")));
        }
        let id = match RecordIdentity::parse(&event.name) {
            Ok(id) => id,
            Err(err) => {
                warn!(target = "harvest.enrich", %trigger, object = %event.name, "foreign_object_ignored");
                return Ok(ignored(trigger, err.to_string()));
            }
        };
        let image = StoredObject {
            bucket: event.bucket.clone(),
            name: event.name.clone(),
        };

        let labels = capture_stage("classify", &mut stages, async {
            let labels = self
                .classifier
                .detect_labels(&image)
                .await
                .map_err(|err| PipelineError::downstream("classify", err))?;
            let logos = self
                .classifier
                .detect_logos(&image)
                .await
                .map_err(|err| PipelineError::downstream("classify", err))?;
            let output = json!({
                "image": image.gcs_uri(),
                "labels": labels.len(),
                "logos": logos.len(),
            });
            Ok(StageOutcome::new((labels, logos), output))
        })
        .await?;

        let confident = capture_stage("filter", &mut stages, async {
            let confident = confident_labels(
                labels.0.into_iter().chain(labels.1),
                self.min_confidence,
            );
            let output = json!({ "threshold": self.min_confidence, "kept": confident });
            Ok(StageOutcome::new(confident, output))
        })
        .await?;

        if confident.is_empty() {
            info!(target = "harvest.enrich", %id, "no_confident_labels");
            return Ok(RunReport {
                trigger,
                outcome: EnrichOutcome::NoLabels,
                stages,
            });
        }

        let mut advert = capture_stage("load", &mut stages, async {
            let advert = self
                .store
                .get(&id)
                .await
                .map_err(|err| PipelineError::downstream("load", err))?
                .ok_or_else(|| {
                    PipelineError::not_found_yet("load", format!("advert {id} is not stored yet"))
                })?;
            Ok(StageOutcome::new(advert, json!({ "id": id })))
        })
        .await?;

        advert.merge_labels(confident.clone());
        capture_stage("persist", &mut stages, async {
            self.store
                .put(&advert)
                .await
                .map_err(|err| PipelineError::downstream("persist", err))?;
            Ok(StageOutcome::new((), json!({ "id": id, "labels": confident.len() })))
        })
        .await?;
        info!(target = "harvest.enrich", %id, labels = confident.len(), "advert_enriched");

        Ok(RunReport {
            trigger,
            outcome: EnrichOutcome::Enriched {
                id,
                labels: confident,
            },
            stages,
        })
    }
}

fn ignored(trigger: String, reason: String) -> RunReport<EnrichOutcome> {
    RunReport {
        trigger,
        outcome: EnrichOutcome::Ignored { reason },
        stages: Vec::new(),
    }
}

/// Keeps annotations scoring at least `threshold`; a label reported twice
/// keeps its higher score.
pub fn confident_labels(
    annotations: impl IntoIterator<Item = Annotation>,
    threshold: f64,
) -> LabelScores {
    let mut kept = LabelScores::new();
    for Annotation { label, score } in annotations {
        if score < threshold || label.trim().is_empty() {
            continue;
        }
        let entry = kept.entry(label).or_insert(score);
        if score > *entry {
            *entry = score;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::StoredAdvert;
    use crate::memory::MemoryBackends;
    use crate::pipeline::{PipelineErrorKind, encode_message};
    use chrono::Utc;
    use std::collections::HashMap;

    fn annotation(label: &str, score: f64) -> Annotation {
        Annotation {
            label: label.into(),
            score,
        }
    }

    fn event_for(id: &RecordIdentity) -> ObjectEvent {
        ObjectEvent {
            bucket: "hades-bucket".into(),
            name: id.to_string(),
            event_type: Some(OBJECT_FINALIZE.into()),
        }
    }

    async fn seeded(memory: &MemoryBackends) -> RecordIdentity {
        let id = RecordIdentity::generate();
        let fields = [("itemId".to_string(), "1".to_string())].into();
        memory
            .store
            .put(&StoredAdvert::new(id, fields, Utc::now()))
            .await
            .unwrap();
        id
    }

    #[test]
    fn threshold_keeps_only_confident_labels() {
        let kept = confident_labels(
            vec![annotation("Shoe", 0.92), annotation("Blur", 0.40)],
            DEFAULT_MIN_CONFIDENCE,
        );
        assert_eq!(kept, LabelScores::from([("Shoe".to_string(), 0.92)]));
    }

    #[test]
    fn threshold_is_inclusive_and_duplicates_keep_max() {
        let kept = confident_labels(
            vec![
                annotation("Nike", 0.80),
                annotation("Nike", 0.95),
                annotation("Nike", 0.81),
            ],
            0.80,
        );
        assert_eq!(kept["Nike"], 0.95);
    }

    #[tokio::test]
    async fn merges_labels_and_logos_into_existing_record() {
        let memory = MemoryBackends::new();
        memory
            .classifier
            .respond(
                vec![annotation("Shoe", 0.92), annotation("Blur", 0.40)],
                vec![annotation("Nike", 0.88)],
            )
            .await;
        let id = seeded(&memory).await;

        let pipeline = EnrichmentPipeline::new(&memory.backends(), DEFAULT_MIN_CONFIDENCE);
        let report = pipeline.run("t-1".into(), event_for(&id)).await.unwrap();
        assert!(matches!(report.outcome, EnrichOutcome::Enriched { .. }));

        let stored = memory.store.get(&id).await.unwrap().unwrap();
        let labels = stored.machine_learning.expect("labels");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["Shoe"], 0.92);
        assert_eq!(labels["Nike"], 0.88);
        assert_eq!(stored.fields["itemId"], "1");
    }

    #[tokio::test]
    async fn no_confident_labels_means_no_write() {
        let memory = MemoryBackends::new();
        memory
            .classifier
            .respond(vec![annotation("Blur", 0.40)], vec![])
            .await;
        let id = seeded(&memory).await;
        let writes_before = memory.store.writes().await;

        let pipeline = EnrichmentPipeline::new(&memory.backends(), DEFAULT_MIN_CONFIDENCE);
        let report = pipeline.run("t-2".into(), event_for(&id)).await.unwrap();
        assert!(matches!(report.outcome, EnrichOutcome::NoLabels));
        assert_eq!(memory.store.writes().await, writes_before);
        let stored = memory.store.get(&id).await.unwrap().unwrap();
        assert!(stored.machine_learning.is_none());
    }

    #[tokio::test]
    async fn event_before_record_is_retryable_and_writes_nothing() {
        let memory = MemoryBackends::new();
        memory
            .classifier
            .respond(vec![annotation("Shoe", 0.92)], vec![])
            .await;
        let id = RecordIdentity::generate();

        let pipeline = EnrichmentPipeline::new(&memory.backends(), DEFAULT_MIN_CONFIDENCE);
        let err = pipeline
            .run("t-3".into(), event_for(&id))
            .await
            .expect_err("record missing");
        assert_eq!(err.kind(), PipelineErrorKind::NotFoundYet);
        assert!(err.is_retryable());
        assert_eq!(memory.store.len().await, 0);
    }

    #[tokio::test]
    async fn classifier_failure_is_downstream() {
        let memory = MemoryBackends::new();
        memory.classifier.fail_with("quota exceeded").await;
        let id = seeded(&memory).await;
        let pipeline = EnrichmentPipeline::new(&memory.backends(), DEFAULT_MIN_CONFIDENCE);
        let err = pipeline.run("t-4".into(), event_for(&id)).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Downstream);
        assert_eq!(err.stage(), "classify");
    }

    #[tokio::test]
    async fn foreign_objects_and_other_events_are_ignored() {
        let memory = MemoryBackends::new();
        let pipeline = EnrichmentPipeline::new(&memory.backends(), DEFAULT_MIN_CONFIDENCE);

        let foreign = ObjectEvent {
            bucket: "hades-bucket".into(),
            name: "https:--i.ebayimg.com-thumbs-s-l140.jpg".into(),
            event_type: None,
        };
        let report = pipeline.run("t-5".into(), foreign).await.unwrap();
        assert!(matches!(report.outcome, EnrichOutcome::Ignored { .. }));

        let mut deleted = event_for(&RecordIdentity::generate());
        deleted.event_type = Some("OBJECT_DELETE".into());
        let report = pipeline.run("t-6".into(), deleted).await.unwrap();
        assert!(matches!(report.outcome, EnrichOutcome::Ignored { .. }));
        assert_eq!(memory.classifier.calls().await, 0);
    }

    #[test]
    fn event_from_attributes_or_resource_data() {
        let attributes: HashMap<String, String> = [
            ("eventType".to_string(), OBJECT_FINALIZE.to_string()),
            ("bucketId".to_string(), "hades-bucket".to_string()),
            ("objectId".to_string(), "abc".to_string()),
        ]
        .into();
        let message = PubsubMessage {
            attributes,
            ..Default::default()
        };
        let event = ObjectEvent::from_message(&message).unwrap();
        assert_eq!(event.bucket, "hades-bucket");
        assert_eq!(event.name, "abc");

        let message = PubsubMessage {
            data: Some(encode_message(br#"{"bucket":"b","name":"n","size":"10"}"#)),
            ..Default::default()
        };
        let event = ObjectEvent::from_message(&message).unwrap();
        assert_eq!((event.bucket.as_str(), event.name.as_str()), ("b", "n"));
        assert!(event.event_type.is_none());

        assert!(ObjectEvent::from_message(&PubsubMessage::default()).is_none());
    }
}
