use super::{TokenSource, check_status};
use crate::backends::{BackendError, MessagePublisher};
use crate::pipeline::encode_message;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Publishes to one topic through the Pub/Sub REST API.
#[derive(Clone)]
pub struct PubsubPublisher {
    http: Client,
    tokens: TokenSource,
    publish_url: String,
}

impl PubsubPublisher {
    pub fn new(http: Client, tokens: TokenSource, base_url: &str, project: &str, topic: &str) -> Self {
        Self {
            http,
            tokens,
            publish_url: format!("{base_url}/v1/projects/{project}/topics/{topic}:publish"),
        }
    }
}

#[async_trait]
impl MessagePublisher for PubsubPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<String, BackendError> {
        let token = self.tokens.token().await?;
        let body = json!({ "messages": [{ "data": encode_message(&payload) }] });
        let response = self
            .http
            .post(&self.publish_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| BackendError::Request(err.to_string()))?;
        let response = check_status(response, "pubsub publish").await?;
        let published: PublishResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))?;
        let id = published
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Deserialize("publish returned no message id".into()))?;
        debug!(target = "harvest.gcp", message_id = %id, bytes = payload.len(), "message_published");
        Ok(id)
    }
}
