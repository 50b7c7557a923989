use super::{DecodeError, PipelineError, StageOutcome, capture_stage, decode_message};
use crate::backends::{Backends, MessagePublisher, SearchProvider};
use crate::models::{PubsubMessage, RunReport};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs one keyword search and republishes every result item as its own
/// message.
#[derive(Clone)]
pub struct SearchDispatchPipeline {
    search: Arc<dyn SearchProvider>,
    publisher: Arc<dyn MessagePublisher>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Skipped {
        reason: String,
    },
    Dispatched {
        keywords: String,
        message_ids: Vec<String>,
    },
}

impl SearchDispatchPipeline {
    pub fn new(backends: &Backends) -> Self {
        Self {
            search: backends.search.clone(),
            publisher: backends.publisher.clone(),
        }
    }

    pub async fn run(
        &self,
        message: &PubsubMessage,
    ) -> Result<RunReport<DispatchOutcome>, PipelineError> {
        let trigger = message.trigger_id();
        let mut stages = Vec::new();

        let keywords = capture_stage("decode", &mut stages, async {
            let keywords = decode_keywords(message.data.as_deref(), &trigger);
            let output = match &keywords {
                Ok(keywords) => json!({ "keywords": keywords }),
                Err(reason) => json!({ "skipped": reason }),
            };
            Ok(StageOutcome::new(keywords, output))
        })
        .await?;
        let keywords = match keywords {
            Ok(keywords) => keywords,
            Err(reason) => {
                return Ok(RunReport {
                    trigger,
                    outcome: DispatchOutcome::Skipped { reason },
                    stages,
                });
            }
        };

        let items = capture_stage("search", &mut stages, async {
            let items = self
                .search
                .search(&keywords)
                .await
                .map_err(|err| PipelineError::downstream("search", err))?;
            let output = json!({ "items": items.len() });
            Ok(StageOutcome::new(items, output))
        })
        .await?;

        let message_ids = capture_stage("fan_out", &mut stages, async {
            let mut ids = Vec::with_capacity(items.len());
            for item in &items {
                let payload = serde_json::to_vec(item)
                    .map_err(|err| PipelineError::internal("fan_out", err.to_string()))?;
                let id = self
                    .publisher
                    .publish(payload)
                    .await
                    .map_err(|err| PipelineError::downstream("fan_out", err))?;
                ids.push(id);
            }
            let output = json!({ "published": ids.len() });
            Ok(StageOutcome::new(ids, output))
        })
        .await?;
        info!(target = "harvest.dispatch", %trigger, %keywords, published = message_ids.len(), "search_dispatched");

        Ok(RunReport {
            trigger,
            outcome: DispatchOutcome::Dispatched {
                keywords,
                message_ids,
            },
            stages,
        })
    }
}

/// The first non-blank string value in document order; other keys are
/// not searched.
fn decode_keywords(data: Option<&str>, trigger: &str) -> Result<String, String> {
    let document = match decode_message(data) {
        Ok(document) => document,
        Err(DecodeError::Missing) => {
            warn!(target = "harvest.dispatch", %trigger, "no data in message");
            return Err(DecodeError::Missing.to_string());
        }
        Err(err) => {
            error!(target = "harvest.dispatch", %trigger, error = %err, "undecodable_message");
            return Err(err.to_string());
        }
    };
    let Value::Object(map) = document else {
        error!(target = "harvest.dispatch", %trigger, "payload_not_an_object");
        return Err("payload is not a json object".into());
    };
    let mut values = map.values();
    let keywords = values
        .by_ref()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string);
    match keywords {
        Some(keywords) => {
            let extra = values.count();
            if extra > 0 {
                warn!(target = "harvest.dispatch", %trigger, extra, "additional_keywords_ignored");
            }
            Ok(keywords)
        }
        None => {
            warn!(target = "harvest.dispatch", %trigger, "no_keywords_in_message");
            Err("message contained no keywords".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::ImageReferenceResolver;
    use crate::backends::AdvertStore;
    use crate::memory::MemoryBackends;
    use crate::pipeline::{IngestOutcome, IngestionPipeline, encode_message};
    use std::collections::HashSet;

    fn message(data: &str) -> PubsubMessage {
        PubsubMessage {
            data: Some(encode_message(data.as_bytes())),
            message_id: Some("d-1".into()),
            ..Default::default()
        }
    }

    fn item(id: &str, token: &str) -> Value {
        json!({
            "itemId": [id],
            "galleryURL": [format!("https://i.ebayimg.com/thumbs/images/g/{token}/s-l140.jpg")]
        })
    }

    #[tokio::test]
    async fn one_search_and_one_message_per_item() {
        let memory = MemoryBackends::new();
        memory
            .search
            .respond(vec![
                item("1", "AAAAAAAAAAAAAAAA"),
                item("2", "BBBBBBBBBBBBBBBB"),
                item("3", "CCCCCCCCCCCCCCCC"),
            ])
            .await;
        let dispatch = SearchDispatchPipeline::new(&memory.backends());
        let report = dispatch.run(&message(r#"{"q":"vintage camera"}"#)).await.unwrap();

        assert_eq!(memory.search.calls().await, vec!["vintage camera".to_string()]);
        let DispatchOutcome::Dispatched { message_ids, .. } = report.outcome else {
            panic!("expected dispatch");
        };
        assert_eq!(message_ids.len(), 3);

        let published = memory.publisher.sent().await;
        assert_eq!(published.len(), 3);
        let first: Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(first, item("1", "AAAAAAAAAAAAAAAA"));
    }

    #[tokio::test]
    async fn multiple_keys_still_search_once_with_first_value() {
        let memory = MemoryBackends::new();
        let dispatch = SearchDispatchPipeline::new(&memory.backends());
        dispatch
            .run(&message(r#"{"b":"lens","a":"tripod","c":"flash"}"#))
            .await
            .unwrap();
        assert_eq!(memory.search.calls().await, vec!["lens".to_string()]);
    }

    #[tokio::test]
    async fn missing_or_empty_keywords_skip_search() {
        let memory = MemoryBackends::new();
        let dispatch = SearchDispatchPipeline::new(&memory.backends());
        for msg in [
            PubsubMessage::default(),
            message("{}"),
            message(r#"{"q":"   ","n":3}"#),
            message(r#"["camera"]"#),
        ] {
            let report = dispatch.run(&msg).await.unwrap();
            assert!(matches!(report.outcome, DispatchOutcome::Skipped { .. }));
        }
        assert!(memory.search.calls().await.is_empty());
    }

    #[tokio::test]
    async fn search_failure_propagates() {
        let memory = MemoryBackends::new();
        memory.search.fail_with("HTTP 500").await;
        let dispatch = SearchDispatchPipeline::new(&memory.backends());
        let err = dispatch.run(&message(r#"{"q":"camera"}"#)).await.unwrap_err();
        assert_eq!(err.stage(), "search");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn dispatched_items_ingest_into_distinct_records() {
        let memory = MemoryBackends::new();
        memory
            .search
            .respond(vec![
                item("1", "AAAAAAAAAAAAAAAA"),
                item("2", "BBBBBBBBBBBBBBBB"),
                item("3", "CCCCCCCCCCCCCCCC"),
            ])
            .await;
        let backends = memory.backends();
        SearchDispatchPipeline::new(&backends)
            .run(&message(r#"{"q":"vintage camera"}"#))
            .await
            .unwrap();

        let ingest = IngestionPipeline::new(&backends, ImageReferenceResolver::default());
        let mut ids = HashSet::new();
        for payload in memory.publisher.sent().await {
            let msg = PubsubMessage {
                data: Some(encode_message(&payload)),
                ..Default::default()
            };
            let IngestOutcome::Stored { adverts } = ingest.run(&msg).await.unwrap().outcome else {
                panic!("expected stored outcome");
            };
            ids.extend(adverts.into_iter().map(|a| a.id));
        }
        assert_eq!(ids.len(), 3);
        for id in &ids {
            assert!(memory.store.get(id).await.unwrap().is_some());
            assert!(memory.objects.contains(&id.to_string()).await);
        }
        assert_eq!(memory.objects.len().await, 3);
    }
}
