use once_cell::sync::Lazy;
use std::env;

pub static EBAY_ENV: Lazy<String> =
    Lazy::new(|| env::var("EBAY_ENV").unwrap_or_else(|_| "SANDBOX".to_string()));

/// Finding API application id (`SECURITY-APPNAME`).
pub static APP_NAME: Lazy<String> = Lazy::new(|| {
    env::var("EBAY_APP_NAME")
        .or_else(|_| env::var("APPNAME"))
        .unwrap_or_default()
});

pub static GLOBAL_ID: Lazy<String> =
    Lazy::new(|| env::var("EBAY_GLOBAL_ID").unwrap_or_else(|_| "EBAY-US".to_string()));

pub static ENTRIES_PER_PAGE: Lazy<u32> = Lazy::new(|| {
    env::var("EBAY_ENTRIES_PER_PAGE")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| (1..=100).contains(v))
        .unwrap_or(100)
});

pub static FINDING_URL: Lazy<String> = Lazy::new(|| {
    if EBAY_ENV.as_str().eq_ignore_ascii_case("PROD") {
        "https://svcs.ebay.com/services/search/FindingService/v1".to_string()
    } else {
        "https://svcs.sandbox.ebay.com/services/search/FindingService/v1".to_string()
    }
});
