use crate::advert::record::RawItem;
use crate::advert::unpack::first_scalar;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

pub const FULL_RESOLUTION_TEMPLATE: &str = "https://i.ebayimg.com/images/g/{token}/s-l1600.jpg";

// Exactly 16 token characters, bounded by the ends of the URL or by any
// character outside the token alphabet (`/`, `.`, `?`, ...).
static CONTENT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^A-Za-z0-9~_-])([A-Za-z0-9~_-]{16})(?:[^A-Za-z0-9~_-]|$)")
        .expect("content token pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageReference {
    pub item_id: String,
    pub token: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ImageReferenceResolver {
    template: String,
}

impl Default for ImageReferenceResolver {
    fn default() -> Self {
        Self::new(FULL_RESOLUTION_TEMPLATE)
    }
}

impl ImageReferenceResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Full-resolution URL for the item's first gallery image, if one can be
    /// recovered. Items without an `itemId` never get an image.
    pub fn resolve(&self, item: &RawItem) -> Option<ImageReference> {
        let item_id = item.get("itemId").and_then(first_scalar)?;
        let gallery = item.get("galleryURL").and_then(first_scalar)?;
        let token = content_token(&gallery)?;
        Some(ImageReference {
            item_id,
            token: token.to_string(),
            url: self.template.replace("{token}", token),
        })
    }
}

pub fn content_token(url: &str) -> Option<&str> {
    CONTENT_TOKEN
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
