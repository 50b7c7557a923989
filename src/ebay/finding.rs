use crate::advert::RawItem;
use crate::backends::{BackendError, SearchProvider};
use crate::ebay::config::{APP_NAME, ENTRIES_PER_PAGE, FINDING_URL, GLOBAL_ID};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const FINDING_RESPONSE_KEY: &str = "findItemsByKeywordsResponse";

#[derive(Debug, Error)]
pub enum FindingError {
    #[error("search response is missing `findItemsByKeywordsResponse`")]
    MissingResponse,
    #[error("search rejected by provider: {0}")]
    Failure(String),
}

/// `findItemsByKeywords` over the Finding API's JSON binding.
#[derive(Debug, Clone)]
pub struct EbayFindingClient {
    http: Client,
    endpoint: String,
    app_name: String,
    global_id: String,
    entries_per_page: u32,
}

impl EbayFindingClient {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            endpoint: FINDING_URL.clone(),
            app_name: APP_NAME.clone(),
            global_id: GLOBAL_ID.clone(),
            entries_per_page: *ENTRIES_PER_PAGE,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.app_name.trim().is_empty()
    }
}

#[async_trait]
impl SearchProvider for EbayFindingClient {
    async fn search(&self, keywords: &str) -> Result<Vec<RawItem>, BackendError> {
        if !self.is_configured() {
            return Err(BackendError::NotConfigured("EBAY_APP_NAME".into()));
        }
        let entries = self.entries_per_page.to_string();
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("OPERATION-NAME", "findItemsByKeywords"),
                ("SERVICE-VERSION", "1.0.0"),
                ("SECURITY-APPNAME", self.app_name.as_str()),
                ("GLOBAL-ID", self.global_id.as_str()),
                ("RESPONSE-DATA-FORMAT", "JSON"),
                ("REST-PAYLOAD", ""),
                ("outputSelector", "SellerInfo"),
                ("paginationInput.entriesPerPage", entries.as_str()),
                ("keywords", keywords),
            ])
            .send()
            .await
            .map_err(|err| BackendError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))?;
        let items = items_from_response(&payload).map_err(|err| {
            warn!(target = "harvest.ebay", %keywords, error = %err, "finding_search_failed");
            BackendError::Request(err.to_string())
        })?;
        debug!(target = "harvest.ebay", %keywords, items = items.len(), "finding_search_complete");
        Ok(items)
    }
}

/// Collects every item of every search result block in a Finding response.
pub fn items_from_response(payload: &Value) -> Result<Vec<RawItem>, FindingError> {
    let responses = payload
        .get(FINDING_RESPONSE_KEY)
        .and_then(Value::as_array)
        .ok_or(FindingError::MissingResponse)?;

    let mut items = Vec::new();
    for response in responses {
        if first_str(response.get("ack")) == Some("Failure") {
            let message = response
                .pointer("/errorMessage/0/error/0/message")
                .and_then(first_str_value)
                .unwrap_or("unknown error");
            return Err(FindingError::Failure(message.to_string()));
        }
        let results = response
            .get("searchResult")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for result in results {
            let found = result
                .get("item")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            items.extend(found.iter().filter_map(|item| item.as_object().cloned()));
        }
    }
    Ok(items)
}

fn first_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(first_str_value)
}

fn first_str_value(value: &Value) -> Option<&str> {
    match value {
        Value::Array(items) => items.first().and_then(Value::as_str),
        other => other.as_str(),
    }
}
