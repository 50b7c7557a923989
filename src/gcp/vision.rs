use super::{TokenSource, check_status};
use crate::backends::{Annotation, BackendError, ImageClassifier, StoredObject};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum Feature {
    Labels,
    Logos,
}

impl Feature {
    fn request_type(self) -> &'static str {
        match self {
            Feature::Labels => "LABEL_DETECTION",
            Feature::Logos => "LOGO_DETECTION",
        }
    }

    fn response_key(self) -> &'static str {
        match self {
            Feature::Labels => "labelAnnotations",
            Feature::Logos => "logoAnnotations",
        }
    }
}

/// Cloud Vision annotation of images already in Cloud Storage.
#[derive(Clone)]
pub struct VisionClassifier {
    http: Client,
    tokens: TokenSource,
    annotate_url: String,
}

impl VisionClassifier {
    pub fn new(http: Client, tokens: TokenSource, base_url: &str) -> Self {
        Self {
            http,
            tokens,
            annotate_url: format!("{base_url}/v1/images:annotate"),
        }
    }

    async fn annotate(
        &self,
        image: &StoredObject,
        feature: Feature,
    ) -> Result<Vec<Annotation>, BackendError> {
        let token = self.tokens.token().await?;
        let body = json!({
            "requests": [{
                "image": { "source": { "imageUri": image.gcs_uri() } },
                "features": [{ "type": feature.request_type() }],
            }]
        });
        let response = self
            .http
            .post(&self.annotate_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| BackendError::Request(err.to_string()))?;
        let response = check_status(response, "vision annotate").await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))?;
        let annotations = parse_annotations(&payload, feature.response_key())?;
        debug!(
            target = "harvest.gcp",
            image = %image,
            feature = feature.request_type(),
            found = annotations.len(),
            "image_annotated"
        );
        Ok(annotations)
    }
}

#[async_trait]
impl ImageClassifier for VisionClassifier {
    async fn detect_labels(&self, image: &StoredObject) -> Result<Vec<Annotation>, BackendError> {
        self.annotate(image, Feature::Labels).await
    }

    async fn detect_logos(&self, image: &StoredObject) -> Result<Vec<Annotation>, BackendError> {
        self.annotate(image, Feature::Logos).await
    }
}

fn parse_annotations(payload: &Value, key: &str) -> Result<Vec<Annotation>, BackendError> {
    let Some(first) = payload.pointer("/responses/0") else {
        return Ok(Vec::new());
    };
    if let Some(message) = first.pointer("/error/message").and_then(Value::as_str) {
        return Err(BackendError::Request(format!("vision: {message}")));
    }
    let annotations = first
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    Ok(annotations
        .iter()
        .filter_map(|a| {
            Some(Annotation {
                label: a.get("description")?.as_str()?.to_string(),
                score: a.get("score")?.as_f64()?,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_descriptions_and_scores() {
        let payload = json!({
            "responses": [{
                "labelAnnotations": [
                    {"mid": "/m/06rrc", "description": "Shoe", "score": 0.92},
                    {"mid": "/m/0x", "score": 0.5}
                ]
            }]
        });
        let labels = parse_annotations(&payload, "labelAnnotations").unwrap();
        assert_eq!(
            labels,
            vec![Annotation { label: "Shoe".into(), score: 0.92 }]
        );
        assert!(parse_annotations(&payload, "logoAnnotations").unwrap().is_empty());
    }

    #[test]
    fn per_image_error_is_a_failure() {
        let payload = json!({
            "responses": [{ "error": { "code": 7, "message": "permission denied" } }]
        });
        let err = parse_annotations(&payload, "labelAnnotations").unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }
}
