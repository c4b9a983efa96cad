use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use codebox::{Dispatcher, ExecutionResult, FaultKind};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

const MAX_CODE_BODY_BYTES: usize = 2 * 1024 * 1024;
// Inference alone may take two minutes; leave room for the sandbox too.
const HANDLE_TIMEOUT_SECONDS: u64 = 300;

#[derive(Clone)]
pub struct AppConfig {
    pub default_model: String,
    pub models: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: AppConfig,
}

#[derive(Debug, Deserialize)]
pub struct HandleRequest {
    pub code: String,
    pub action: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HandleResponse {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultKind>,
}

impl From<ExecutionResult> for HandleResponse {
    fn from(result: ExecutionResult) -> Self {
        let image_url = result
            .image_path
            .as_ref()
            .and_then(|path| path.file_name())
            .and_then(|name| name.to_str())
            .map(|name| format!("/api/plots/{name}"));
        Self {
            status: if result.is_ok() { "ok" } else { "error" },
            image_path: result
                .image_path
                .map(|path| path.to_string_lossy().into_owned()),
            image_url,
            text: result.text,
            fault: result.fault,
        }
    }
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    default: String,
    models: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

async fn healthcheck() -> Response {
    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = Uuid::new_v4();
    let start = Instant::now();
    tracing::info!(%request_id, %method, %uri, "request");
    let response = next.run(request).await;
    tracing::info!(
        %request_id,
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "response"
    );
    response
}

async fn handle_handler(
    State(state): State<AppState>,
    Json(payload): Json<HandleRequest>,
) -> Response {
    let HandleRequest {
        code,
        action,
        model,
    } = payload;
    let model = model.unwrap_or_else(|| state.config.default_model.clone());
    let dispatcher = state.dispatcher.clone();

    // Sandbox, subprocess and inference calls all block.
    let joined =
        tokio::task::spawn_blocking(move || dispatcher.handle(&code, &action, &model)).await;
    match joined {
        Ok(result) => Json(HandleResponse::from(result)).into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("dispatch task failed: {err}"),
        ),
    }
}

async fn plot_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(path) = state.dispatcher.artifacts().resolve(&name) else {
        return error_response(StatusCode::NOT_FOUND, "plot not found");
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            ],
            bytes,
        )
            .into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            error_response(StatusCode::NOT_FOUND, "plot not found")
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn models_handler(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        default: state.config.default_model.clone(),
        models: state.config.models.clone(),
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let mut response = Json(ErrorBody {
        error: message.to_owned(),
    })
    .into_response();
    *response.status_mut() = status;
    response
}

pub fn router(state: AppState) -> Router {
    let handle_timeout = Duration::from_secs(HANDLE_TIMEOUT_SECONDS);
    Router::new()
        .route("/healthz", get(healthcheck))
        .route("/api/models", get(models_handler))
        .route("/api/plots/{name}", get(plot_handler))
        .route(
            "/api/handle",
            post(handle_handler).layer(
                ServiceBuilder::new()
                    .layer(DefaultBodyLimit::max(MAX_CODE_BODY_BYTES))
                    .layer(TimeoutLayer::with_status_code(
                        StatusCode::REQUEST_TIMEOUT,
                        handle_timeout,
                    ))
                    .layer(ConcurrencyLimitLayer::new(1)),
            ),
        )
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(log_request_response))
        .with_state(state)
}
