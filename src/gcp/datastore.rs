use super::{TokenSource, check_status};
use crate::advert::record::MACHINE_LEARNING_FIELD;
use crate::advert::{FlatRecord, LabelScores, RecordIdentity, StoredAdvert};
use crate::backends::{AdvertStore, BackendError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

/// Datastore refuses to index string values longer than this many bytes.
const MAX_INDEXED_BYTES: usize = 1500;

/// Adverts as Datastore entities, one entity per record keyed by identity.
#[derive(Clone)]
pub struct DatastoreStore {
    http: Client,
    tokens: TokenSource,
    base_url: String,
    project: String,
    kind: String,
}

impl DatastoreStore {
    pub fn new(http: Client, tokens: TokenSource, base_url: &str, project: &str, kind: &str) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.to_string(),
            project: project.to_string(),
            kind: kind.to_string(),
        }
    }

    fn key(&self, id: &RecordIdentity) -> Value {
        entity_key(&self.project, &self.kind, id)
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value, BackendError> {
        let token = self.tokens.token().await?;
        let url = format!("{}/v1/projects/{}:{method}", self.base_url, self.project);
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|err| BackendError::Request(err.to_string()))?;
        let response = check_status(response, method).await?;
        response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))
    }
}

#[async_trait]
impl AdvertStore for DatastoreStore {
    async fn put(&self, advert: &StoredAdvert) -> Result<(), BackendError> {
        let body = json!({
            "mode": "NON_TRANSACTIONAL",
            "mutations": [{ "upsert": to_entity(&self.project, &self.kind, advert) }],
        });
        self.call("commit", &body).await?;
        debug!(target = "harvest.gcp", id = %advert.id, kind = %self.kind, "entity_upserted");
        Ok(())
    }

    async fn get(&self, id: &RecordIdentity) -> Result<Option<StoredAdvert>, BackendError> {
        let body = json!({ "keys": [self.key(id)] });
        let response = self.call("lookup", &body).await?;
        let Some(entity) = response.pointer("/found/0/entity") else {
            return Ok(None);
        };
        from_entity(entity).map(Some)
    }
}

fn entity_key(project: &str, kind: &str, id: &RecordIdentity) -> Value {
    json!({
        "partitionId": { "projectId": project },
        "path": [{ "kind": kind, "name": id.to_string() }],
    })
}

pub fn to_entity(project: &str, kind: &str, advert: &StoredAdvert) -> Value {
    let mut properties = Map::new();
    for (field, value) in &advert.fields {
        let mut property = json!({ "stringValue": value });
        if !StoredAdvert::is_indexed(field) || value.len() > MAX_INDEXED_BYTES {
            property["excludeFromIndexes"] = Value::Bool(true);
        }
        properties.insert(field.clone(), property);
    }
    properties.insert(
        "found_date".into(),
        json!({
            "timestampValue": advert.found_date.to_rfc3339_opts(SecondsFormat::Micros, true)
        }),
    );
    if let Some(labels) = &advert.machine_learning {
        let scores: Map<String, Value> = labels
            .iter()
            .map(|(label, score)| (label.clone(), json!({ "doubleValue": score })))
            .collect();
        properties.insert(
            MACHINE_LEARNING_FIELD.into(),
            json!({ "entityValue": { "properties": scores } }),
        );
    }
    json!({
        "key": entity_key(project, kind, &advert.id),
        "properties": properties,
    })
}

pub fn from_entity(entity: &Value) -> Result<StoredAdvert, BackendError> {
    let name = entity
        .pointer("/key/path/0/name")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Deserialize("entity key has no name".into()))?;
    let id = RecordIdentity::parse(name)
        .map_err(|err| BackendError::Deserialize(err.to_string()))?;
    let properties = entity
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut found_date = None;
    let mut machine_learning = None;
    let mut fields = FlatRecord::new();
    for (field, property) in properties {
        match field.as_str() {
            "found_date" => {
                found_date = property
                    .get("timestampValue")
                    .and_then(Value::as_str)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|ts| ts.with_timezone(&Utc));
            }
            MACHINE_LEARNING_FIELD => {
                let labels: LabelScores = property
                    .pointer("/entityValue/properties")
                    .and_then(Value::as_object)
                    .map(|scores| {
                        scores
                            .iter()
                            .filter_map(|(label, v)| Some((label.clone(), number(v)?)))
                            .collect()
                    })
                    .unwrap_or_default();
                machine_learning = Some(labels);
            }
            _ => match scalar(&property) {
                Some(value) => {
                    fields.insert(field, value);
                }
                None => warn!(target = "harvest.gcp", %id, %field, "unsupported_property_skipped"),
            },
        }
    }

    let found_date = found_date
        .ok_or_else(|| BackendError::Deserialize(format!("entity {id} has no found_date")))?;
    let mut advert = StoredAdvert::new(id, fields, found_date);
    advert.machine_learning = machine_learning;
    Ok(advert)
}

fn number(property: &Value) -> Option<f64> {
    if let Some(v) = property.get("doubleValue") {
        return v.as_f64();
    }
    // integerValue travels as a decimal string
    property
        .get("integerValue")
        .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()))
}

fn scalar(property: &Value) -> Option<String> {
    if let Some(s) = property.get("stringValue").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    if property.get("nullValue").is_some() {
        return Some(String::new());
    }
    if let Some(b) = property.get("booleanValue").and_then(Value::as_bool) {
        return Some(b.to_string());
    }
    if let Some(i) = property.get("integerValue") {
        return i.as_str().map(str::to_string).or_else(|| Some(i.to_string()));
    }
    property.get("doubleValue").map(Value::to_string)
}
