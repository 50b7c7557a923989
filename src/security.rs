use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashSet, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

/// Shared tokens accepted on push trigger routes. An empty set disables the
/// check.
#[derive(Clone, Default)]
pub struct PushAuth {
    tokens: Arc<HashSet<String>>,
}

impl PushAuth {
    pub fn from_env() -> Self {
        let raw = env::var("PUSH_AUTH_TOKENS").unwrap_or_default();
        let auth = Self::from_tokens(raw.split(','));
        if auth.is_enabled() {
            info!(
                target = "harvest.api",
                token_count = auth.tokens.len(),
                "push authentication enabled"
            );
        } else {
            warn!(
                target = "harvest.api",
                "PUSH_AUTH_TOKENS is empty; trigger routes accept unauthenticated pushes"
            );
        }
        auth
    }

    pub fn from_tokens<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Self {
        let tokens = tokens
            .into_iter()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            tokens: Arc::new(tokens),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    fn accepts(&self, presented: &str) -> bool {
        self.tokens.contains(presented)
    }
}

pub async fn require_push_token(
    State(auth): State<PushAuth>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if !auth.is_enabled() {
        return Ok(next.run(request).await);
    }
    let presented =
        extract_bearer(request.headers()).or_else(|| extract_query_token(request.uri().query()));
    let Some(presented) = presented else {
        return Ok(unauthorized_response(
            "missing_push_token",
            "Provide a Bearer token or ?token=",
        ));
    };
    if !auth.accepts(&presented) {
        warn!(target = "harvest.api", path = %request.uri().path(), "rejected push token");
        return Ok(unauthorized_response("invalid_push_token", "Token not recognized"));
    }
    Ok(next.run(request).await)
}

fn extract_bearer(headers: &http::HeaderMap) -> Option<String> {
    let raw = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    if raw.len() >= 7 && raw[..6].eq_ignore_ascii_case("bearer") {
        Some(raw[6..].trim().to_string()).filter(|t| !t.is_empty())
    } else {
        None
    }
}

fn extract_query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_is_case_insensitive() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("bearer s3cret"),
        );
        assert_eq!(extract_bearer(&headers).as_deref(), Some("s3cret"));
    }

    #[test]
    fn query_token_is_url_decoded() {
        assert_eq!(
            extract_query_token(Some("a=1&token=s3%2Bcret")).as_deref(),
            Some("s3+cret")
        );
        assert_eq!(extract_query_token(Some("token=")), None);
        assert_eq!(extract_query_token(None), None);
    }

    #[test]
    fn blank_entries_are_ignored() {
        let auth = PushAuth::from_tokens(" , ,".split(','));
        assert!(!auth.is_enabled());
        let auth = PushAuth::from_tokens("a, b".split(','));
        assert!(auth.accepts("b"));
    }
}
