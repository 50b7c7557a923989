use std::env;

pub const DEFAULT_RESULTS_TOPIC: &str = "api-results";
pub const DEFAULT_IMAGE_BUCKET: &str = "hades-bucket";
pub const DEFAULT_ADVERT_KIND: &str = "ebay-adverts";

#[derive(Debug, Clone)]
pub struct GcpConfig {
    pub project: String,
    pub results_topic: String,
    pub image_bucket: String,
    pub advert_kind: String,
    pub access_token: Option<String>,
    pub datastore_url: String,
    pub pubsub_url: String,
    pub storage_url: String,
    pub vision_url: String,
}

impl GcpConfig {
    pub fn from_env() -> Self {
        Self {
            project: env::var("GCP_PROJECT")
                .or_else(|_| env::var("GOOGLE_CLOUD_PROJECT"))
                .unwrap_or_default(),
            results_topic: var_or("ADVERT_RESULTS_TOPIC", DEFAULT_RESULTS_TOPIC),
            image_bucket: var_or("ADVERT_IMAGE_BUCKET", DEFAULT_IMAGE_BUCKET),
            advert_kind: var_or("ADVERT_KIND", DEFAULT_ADVERT_KIND),
            access_token: env::var("GCP_ACCESS_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            datastore_url: base_url("DATASTORE_URL", "https://datastore.googleapis.com"),
            pubsub_url: base_url("PUBSUB_URL", "https://pubsub.googleapis.com"),
            storage_url: base_url("STORAGE_URL", "https://storage.googleapis.com"),
            vision_url: base_url("VISION_URL", "https://vision.googleapis.com"),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.project.trim().is_empty()
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn base_url(key: &str, default: &str) -> String {
    var_or(key, default).trim_end_matches('/').to_string()
}
