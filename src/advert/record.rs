use crate::advert::identity::RecordIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// One search-result item exactly as the provider returned it.
pub type RawItem = Map<String, Value>;

/// Flattened item: field name to string value.
pub type FlatRecord = BTreeMap<String, String>;

/// Classifier label to confidence in `[0, 1]`.
pub type LabelScores = BTreeMap<String, f64>;

/// Large free-text fields that the document store should not index.
pub const UNINDEXED_FIELDS: [&str; 5] = [
    "condition",
    "listingInfo",
    "primaryCategory",
    "sellingStatus",
    "shippingInfo",
];

pub const MACHINE_LEARNING_FIELD: &str = "MachineLearning";

const RESERVED_FIELDS: [&str; 3] = ["id", "found_date", MACHINE_LEARNING_FIELD];

/// A persisted advert.
///
/// `id` and `found_date` are fixed at creation. `machine_learning` stays
/// `None` until enrichment finds at least one confident label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAdvert {
    pub id: RecordIdentity,
    pub found_date: DateTime<Utc>,
    #[serde(
        rename = "MachineLearning",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub machine_learning: Option<LabelScores>,
    #[serde(flatten)]
    pub fields: FlatRecord,
}

impl StoredAdvert {
    pub fn new(id: RecordIdentity, mut fields: FlatRecord, found_date: DateTime<Utc>) -> Self {
        for reserved in RESERVED_FIELDS {
            if fields.remove(reserved).is_some() {
                warn!(target = "harvest.ingest", %id, field = reserved, "reserved_field_dropped");
            }
        }
        Self {
            id,
            found_date,
            machine_learning: None,
            fields,
        }
    }

    /// Adds `labels` under `MachineLearning`, keeping labels already present.
    pub fn merge_labels(&mut self, labels: LabelScores) {
        self.machine_learning
            .get_or_insert_with(LabelScores::new)
            .extend(labels);
    }

    pub fn is_indexed(field: &str) -> bool {
        !UNINDEXED_FIELDS.contains(&field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FlatRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reserved_keys_are_dropped_from_flat_fields() {
        let id = RecordIdentity::generate();
        let advert = StoredAdvert::new(
            id,
            fields(&[("id", "spoof"), ("title", "Camera"), ("found_date", "x")]),
            Utc::now(),
        );
        assert_eq!(advert.id, id);
        assert_eq!(advert.fields, fields(&[("title", "Camera")]));
        assert!(advert.machine_learning.is_none());
    }

    #[test]
    fn serializes_flat_with_optional_machine_learning() {
        let mut advert = StoredAdvert::new(
            RecordIdentity::generate(),
            fields(&[("itemId", "123")]),
            Utc::now(),
        );
        let plain = serde_json::to_value(&advert).unwrap();
        assert_eq!(plain["itemId"], "123");
        assert!(plain.get("MachineLearning").is_none());

        advert.merge_labels(LabelScores::from([("Shoe".to_string(), 0.92)]));
        let enriched = serde_json::to_value(&advert).unwrap();
        assert_eq!(enriched["MachineLearning"]["Shoe"], 0.92);

        let back: StoredAdvert = serde_json::from_value(enriched).unwrap();
        assert_eq!(back, advert);
    }

    #[test]
    fn merge_keeps_existing_labels() {
        let mut advert =
            StoredAdvert::new(RecordIdentity::generate(), FlatRecord::new(), Utc::now());
        advert.merge_labels(LabelScores::from([("Shoe".to_string(), 0.92)]));
        advert.merge_labels(LabelScores::from([("Nike".to_string(), 0.85)]));
        let labels = advert.machine_learning.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["Shoe"], 0.92);
    }

    #[test]
    fn free_text_fields_are_not_indexed() {
        assert!(!StoredAdvert::is_indexed("shippingInfo"));
        assert!(StoredAdvert::is_indexed("sellerUserName"));
    }
}
