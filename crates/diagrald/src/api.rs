use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::body::Bytes;
use axum::extract::MatchedPath;
use axum::extract::Path;
use axum::extract::State;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::config::HttpConfig;
use crate::engine::Engine;
use crate::engine::RoutingError;
use crate::engine::ServiceError;
use crate::engine::ToIntegrationMessage;
use crate::webhooks::WebhookRegistry;

/// How long an integration gets to answer a diagnostics request
const DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(10);

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    integrations: Vec<String>,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
    webhooks: Arc<WebhookRegistry>,
}

/// Error body: `{"error": "..."}`
#[derive(Debug)]
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<RoutingError> for ApiError {
    fn from(e: RoutingError) -> Self {
        let status = match e {
            RoutingError::UnknownEntity(_) | RoutingError::UnknownIntegration(_) => {
                StatusCode::NOT_FOUND
            }
            RoutingError::NotEntityScoped => StatusCode::BAD_REQUEST,
            RoutingError::Closed(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError(status, e.to_string())
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let status = match e {
            ServiceError::UnknownService(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidData(_) => StatusCode::BAD_REQUEST,
        };
        ApiError(status, e.to_string())
    }
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            integrations: state.engine.integration_names(),
        }),
    )
}

/// Handler for GET /v1/state
#[tracing::instrument(skip(state))]
async fn engine_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.state_snapshot();
    Json(snapshot.as_ref().clone())
}

/// Handler for GET /v1/diagnostics/:integration
#[tracing::instrument(skip(state))]
async fn diagnostics(
    State(state): State<Arc<AppState>>,
    Path(integration): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (reply, response) = oneshot::channel();
    state
        .engine
        .send_to_integration(&integration, ToIntegrationMessage::Diagnostics { reply })?;

    match tokio::time::timeout(DIAGNOSTICS_TIMEOUT, response).await {
        Ok(Ok(diagnostics)) => Ok(Json(diagnostics)),
        Ok(Err(_)) => Err(ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{} dropped the diagnostics request", integration),
        )),
        Err(_) => Err(ApiError(
            StatusCode::GATEWAY_TIMEOUT,
            format!("{} did not answer in time", integration),
        )),
    }
}

/// Handler for POST /v1/services/:integration/:service
///
/// Entity-scoped services go to the entity's owner; the others to the named
/// integration.
#[tracing::instrument(skip(state, body))]
async fn call_service(
    State(state): State<Arc<AppState>>,
    Path((integration, service)): Path<(String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let data = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).map_err(ServiceError::from)?
    };

    let msg = ToIntegrationMessage::from_service(&service, data)?;
    if msg.entity_id().is_some() {
        state.engine.send_command(msg)?;
    } else {
        state.engine.send_to_integration(&integration, msg)?;
    }

    tracing::info!("Service {}.{} called", integration, service);
    Ok((
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    ))
}

/// Handler for POST /api/webhook/:id
///
/// Always answers 200 so the sender never learns which ids exist.
#[tracing::instrument(skip_all)]
async fn webhook(
    State(state): State<Arc<AppState>>,
    Path(webhook_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    if !state.webhooks.dispatch(&webhook_id, body.to_vec()) {
        tracing::warn!("Received webhook for unknown id");
    }
    StatusCode::OK
}

/// Request span keyed on the route pattern, so webhook ids stay out of logs.
fn request_span(request: &Request<Body>) -> Span {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or("unmatched");
    tracing::debug_span!("request", method = %request.method(), path)
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/state", get(engine_state))
        .route("/v1/diagnostics/:integration", get(diagnostics))
        .route("/v1/services/:integration/:service", post(call_service))
        .route("/api/webhook/:id", post(webhook))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `http.listen:http.port` and serves until `shutdown_rx` fires.
pub async fn serve(
    http: &HttpConfig,
    engine: Arc<Engine>,
    webhooks: Arc<WebhookRegistry>,
    shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState {
        version,
        engine,
        webhooks,
    });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", http.listen, http.port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
