mod advert;
mod backends;
mod bus;
mod config;
mod ebay;
mod gcp;
mod http;
mod memory;
mod metrics;
mod models;
mod pipeline;
mod security;

use advert::ImageReferenceResolver;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use backends::Backends;
use bus::{EventRouter, LocalBus, RedeliveryPolicy};
use config::{BackendKind, HarvestConfig};
use crate::http::{HttpImageFetcher, build_client};
use ebay::EbayFindingClient;
use eyre::WrapErr;
use memory::MemoryBackends;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, PushEnvelope, RunReport};
use pipeline::{
    DispatchOutcome, EnrichOutcome, EnrichmentPipeline, IngestOutcome, IngestionPipeline,
    ObjectEvent, PipelineError, PipelineErrorKind, SearchDispatchPipeline,
};
use security::{PushAuth, require_push_token};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Seconds a push transport should wait before redelivering a trigger whose
/// record is not committed yet.
const NOT_FOUND_RETRY_AFTER_SECS: &str = "10";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "harvest.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = HarvestConfig::from_env();
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let http_client = build_client();
    let search = EbayFindingClient::from_env();
    if !search.is_configured() {
        warn!(target = "harvest.ebay", "EBAY_APP_NAME is not set; searches will fail");
    }
    let search = Arc::new(search);
    let fetcher = Arc::new(HttpImageFetcher::new(http_client.clone()));

    let (backends, receiver) = match config.backend {
        BackendKind::Gcp => {
            let gcp_config = gcp::GcpConfig::from_env();
            if !gcp_config.is_configured() {
                eyre::bail!("GCP_PROJECT must be set when ADVERT_BACKEND=gcp");
            }
            info!(
                target = "harvest.api",
                project = %gcp_config.project,
                topic = %gcp_config.results_topic,
                bucket = %gcp_config.image_bucket,
                "using gcp backends"
            );
            (gcp::backends(&gcp_config, http_client, search, fetcher), None)
        }
        BackendKind::Memory => {
            let (bus, receiver) = LocalBus::channel();
            let mut backends = MemoryBackends::with_bus(Some(bus.clone())).backends();
            backends.search = search;
            backends.fetcher = fetcher;
            info!(target = "harvest.api", "using in-memory backends with local bus");
            (backends, Some((bus, receiver)))
        }
    };

    let mut state = AppState::new(&config, &backends, Some(prometheus_handle));
    let mut _worker = None;
    if let Some((bus, receiver)) = receiver {
        let router = EventRouter::new(
            state.ingest.clone(),
            state.enrich.clone(),
            RedeliveryPolicy::from_config(&config),
        );
        _worker = Some(receiver.spawn(router));
        state.bus = Some(bus);
    }

    let app = build_router(state, PushAuth::from_env(), config.body_limit);
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "harvest.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    dispatch: SearchDispatchPipeline,
    ingest: IngestionPipeline,
    enrich: EnrichmentPipeline,
    prometheus_handle: Option<PrometheusHandle>,
    bus: Option<LocalBus>,
}

impl AppState {
    fn new(
        config: &HarvestConfig,
        backends: &Backends,
        prometheus_handle: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            dispatch: SearchDispatchPipeline::new(backends),
            ingest: IngestionPipeline::new(
                backends,
                ImageReferenceResolver::new(config.image_template.clone()),
            ),
            enrich: EnrichmentPipeline::new(backends, config.min_confidence),
            prometheus_handle,
            bus: None,
        }
    }
}

fn build_router(state: AppState, auth: PushAuth, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let triggers = Router::new()
        .route("/search", post(trigger_search))
        .route("/adverts", post(trigger_adverts))
        .route("/images", post(trigger_images))
        .route_layer(middleware::from_fn_with_state(auth, require_push_token));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest("/triggers", triggers)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Liveness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Includes local bus counters when running on the memory backend.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let bus = match &state.bus {
        Some(bus) => Some(bus.stats().await),
        None => None,
    };
    Json(json!({
        "status": "ok",
        "service": "advert-harvest",
        "bus": bus,
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state
        .prometheus_handle
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Search request pushed by the scheduler.
///
/// - Method: `POST`
/// - Path: `/triggers/search`
/// - Body: Pub/Sub push envelope whose data is `{"<any key>": "<keywords>"}`
/// - Response: `RunReport<DispatchOutcome>`
async fn trigger_search(
    State(state): State<AppState>,
    Json(envelope): Json<PushEnvelope>,
) -> Result<Json<RunReport<DispatchOutcome>>, AppError> {
    crate::metrics::inc_trigger("/triggers/search");
    let report = state.dispatch.run(&envelope.message).await?;
    Ok(Json(report))
}

/// One search result item, or a legacy batch response.
async fn trigger_adverts(
    State(state): State<AppState>,
    Json(envelope): Json<PushEnvelope>,
) -> Result<Json<RunReport<IngestOutcome>>, AppError> {
    crate::metrics::inc_trigger("/triggers/adverts");
    let report = state.ingest.run(&envelope.message).await?;
    Ok(Json(report))
}

/// Storage notification for a newly written image.
async fn trigger_images(
    State(state): State<AppState>,
    Json(envelope): Json<PushEnvelope>,
) -> Result<Json<RunReport<EnrichOutcome>>, AppError> {
    crate::metrics::inc_trigger("/triggers/images");
    let trigger = envelope.message.trigger_id();
    let Some(event) = ObjectEvent::from_message(&envelope.message) else {
        warn!(target = "harvest.api", %trigger, "notification names no object");
        return Ok(Json(RunReport {
            trigger,
            outcome: EnrichOutcome::Ignored {
                reason: "notification names no object".into(),
            },
            stages: Vec::new(),
        }));
    };
    let report = state.enrich.run(trigger, event).await?;
    Ok(Json(report))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::NotFoundYet => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineErrorKind::Downstream => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                warn!(target = "harvest.api", stage = err.stage(), %status, error = %err, "trigger_failed");
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                let mut response = (status, Json(payload)).into_response();
                if err.kind() == PipelineErrorKind::NotFoundYet {
                    response.headers_mut().insert(
                        header::RETRY_AFTER,
                        HeaderValue::from_static(NOT_FOUND_RETRY_AFTER_SECS),
                    );
                }
                response
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::RecordIdentity;
    use crate::pipeline::encode_message;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app(memory: &MemoryBackends, auth: PushAuth) -> Router {
        let config = HarvestConfig::default();
        let state = AppState::new(&config, &memory.backends(), None);
        build_router(state, auth, config.body_limit)
    }

    fn push(uri: &str, envelope: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(envelope.to_string()))
            .unwrap()
    }

    fn envelope(data: &[u8]) -> Value {
        json!({
            "message": { "data": encode_message(data), "messageId": "42" },
            "subscription": "projects/demo/subscriptions/push"
        })
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let memory = MemoryBackends::new();
        let response = app(&memory, PushAuth::from_tokens(["s3cret"]))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn search_trigger_reports_dispatch() {
        let memory = MemoryBackends::new();
        memory
            .search
            .respond(vec![json!({"itemId": ["1"]}), json!({"itemId": ["2"]})])
            .await;
        let response = app(&memory, PushAuth::default())
            .oneshot(push("/triggers/search", envelope(br#"{"q":"camera"}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["trigger"], "42");
        assert_eq!(report["outcome"]["status"], "dispatched");
        assert_eq!(report["stages"].as_array().unwrap().len(), 3);
        assert_eq!(memory.publisher.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn trigger_routes_require_token_when_configured() {
        let memory = MemoryBackends::new();
        let auth = PushAuth::from_tokens(["s3cret"]);

        let response = app(&memory, auth.clone())
            .oneshot(push("/triggers/adverts", envelope(br#"{"itemId":["1"]}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(&memory, auth)
            .oneshot(push(
                "/triggers/adverts?token=s3cret",
                envelope(br#"{"itemId":["1"]}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(memory.store.len().await, 1);
    }

    #[tokio::test]
    async fn image_before_record_asks_for_redelivery() {
        let memory = MemoryBackends::new();
        memory
            .classifier
            .respond(
                vec![crate::backends::Annotation {
                    label: "Shoe".into(),
                    score: 0.92,
                }],
                vec![],
            )
            .await;
        let name = RecordIdentity::generate().to_string();
        let request = push(
            "/triggers/images",
            json!({
                "message": {
                    "attributes": {
                        "bucketId": "hades-bucket",
                        "objectId": name,
                        "eventType": "OBJECT_FINALIZE"
                    },
                    "messageId": "7"
                }
            }),
        );
        let response = app(&memory, PushAuth::default())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers()[header::RETRY_AFTER],
            NOT_FOUND_RETRY_AFTER_SECS
        );
    }

    #[tokio::test]
    async fn store_outage_maps_to_bad_gateway() {
        let memory = MemoryBackends::new();
        memory.store.fail_writes(true).await;
        let response = app(&memory, PushAuth::default())
            .oneshot(push("/triggers/adverts", envelope(br#"{"itemId":["1"]}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"], "persist");
    }

    #[tokio::test]
    async fn empty_notification_is_acknowledged() {
        let memory = MemoryBackends::new();
        let response = app(&memory, PushAuth::default())
            .oneshot(push("/triggers/images", json!({ "message": {} })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["outcome"]["status"], "ignored");
    }
}
