use crate::advert::record::{FlatRecord, RawItem};
use serde_json::{Map, Value};
use tracing::debug;

/// Names of the nested blocks that get hoisted to the top level.
#[derive(Debug, Clone)]
pub struct KeyPathTable {
    pub seller_key: &'static str,
    pub price_key: &'static str,
    pub current_price_key: &'static str,
    pub value_key: &'static str,
    pub currency_key: &'static str,
}

pub const FINDING_KEY_PATHS: KeyPathTable = KeyPathTable {
    seller_key: "sellerInfo",
    price_key: "sellingStatus",
    current_price_key: "currentPrice",
    value_key: "__value__",
    currency_key: "@currencyId",
};

impl Default for KeyPathTable {
    fn default() -> Self {
        FINDING_KEY_PATHS
    }
}

/// Flattens provider items whose scalars arrive wrapped in one-element lists.
#[derive(Debug, Clone, Default)]
pub struct KeyPathUnpacker {
    table: KeyPathTable,
}

impl KeyPathUnpacker {
    pub fn new(table: KeyPathTable) -> Self {
        Self { table }
    }

    /// Every top-level key is copied in joined-string form. Seller and price
    /// sub-fields are hoisted on top of that and win any key collision.
    pub fn unpack(&self, item: &RawItem) -> FlatRecord {
        let mut record: FlatRecord = item
            .iter()
            .map(|(key, value)| (key.clone(), join_elements(value)))
            .collect();

        let mut hoisted = FlatRecord::new();
        self.hoist_seller(item, &mut hoisted);
        self.hoist_price(item, &mut hoisted);

        for (key, value) in hoisted {
            if let Some(previous) = record.insert(key.clone(), value) {
                debug!(target = "harvest.ingest", field = %key, %previous, "top_level_value_replaced_by_hoisted");
            }
        }
        record
    }

    fn hoist_seller(&self, item: &RawItem, out: &mut FlatRecord) {
        let Some(seller) = item.get(self.table.seller_key).and_then(first_mapping) else {
            return;
        };
        for (key, value) in seller {
            out.insert(key.clone(), join_elements(value));
        }
    }

    fn hoist_price(&self, item: &RawItem, out: &mut FlatRecord) {
        let Some(current) = item
            .get(self.table.price_key)
            .and_then(first_mapping)
            .and_then(|status| status.get(self.table.current_price_key))
            .and_then(first_mapping)
        else {
            return;
        };
        if let Some(value) = current.get(self.table.value_key) {
            out.insert("price".into(), join_elements(value));
        }
        if let Some(currency) = current.get(self.table.currency_key) {
            out.insert("currency".into(), join_elements(currency));
        }
    }
}

/// Descends the `[ { .. } ]` wrapping. A bare mapping is accepted as-is.
fn first_mapping(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Array(items) => items.first()?.as_object(),
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Concatenates the string forms of a sequence's elements with no
/// separator. A scalar behaves like a one-element sequence.
pub fn join_elements(value: &Value) -> String {
    match value {
        Value::Array(items) => items.iter().map(element_string).collect(),
        other => element_string(other),
    }
}

fn element_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}

/// String form of the first element of a list-wrapped scalar.
pub fn first_scalar(value: &Value) -> Option<String> {
    let first = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let text = match first {
        Value::Array(_) | Value::Object(_) | Value::Null => return None,
        scalar => element_string(scalar),
    };
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
