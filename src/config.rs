use crate::advert::image::FULL_RESOLUTION_TEMPLATE;
use crate::pipeline::enrich::DEFAULT_MIN_CONFIDENCE;
use std::{env, str::FromStr, time::Duration};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Gcp,
    /// In-process collaborators wired through the local bus.
    Memory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gcp" => Ok(Self::Gcp),
            "memory" | "local" => Ok(Self::Memory),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub port: u16,
    pub backend: BackendKind,
    pub min_confidence: f64,
    pub image_template: String,
    pub bus_max_attempts: u32,
    pub bus_backoff: Duration,
    pub body_limit: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            backend: BackendKind::Gcp,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            image_template: FULL_RESOLUTION_TEMPLATE.to_string(),
            bus_max_attempts: 5,
            bus_backoff: Duration::from_millis(250),
            body_limit: 1024 * 1024,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backend = match env::var("ADVERT_BACKEND") {
            Ok(raw) => raw.parse().unwrap_or_else(|err: String| {
                warn!(target = "harvest.api", error = %err, "falling back to gcp backend");
                BackendKind::Gcp
            }),
            Err(_) => defaults.backend,
        };
        let image_template = env::var("IMAGE_URL_TEMPLATE")
            .ok()
            .filter(|t| t.contains("{token}"))
            .unwrap_or(defaults.image_template);
        Self {
            port: parsed("PORT").unwrap_or(defaults.port),
            backend,
            min_confidence: parsed::<f64>("ENRICH_MIN_CONFIDENCE")
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(defaults.min_confidence),
            image_template,
            bus_max_attempts: parsed::<u32>("BUS_MAX_ATTEMPTS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.bus_max_attempts),
            bus_backoff: parsed::<u64>("BUS_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.bus_backoff),
            body_limit: parsed::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.body_limit),
        }
    }
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
