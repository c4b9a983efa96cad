use std::sync::Arc;

use app::{AppConfig, AppState, router};
use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use codebox::Dispatcher;
use codebox::artifacts::ArtifactStore;
use codebox::llm::{LlmClient, LlmError};
use codebox::plot::PlotExecutor;
use codebox::sandbox::{SandboxExecutor, TrustMode};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

struct EchoLlm;

#[async_trait]
impl LlmClient for EchoLlm {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        Ok(format!("[{model}] {} chars", prompt.len()))
    }
}

fn test_router() -> axum::Router {
    router_with(Arc::new(ArtifactStore::new(4).unwrap()))
}

fn router_with(artifacts: Arc<ArtifactStore>) -> axum::Router {
    let sandbox = SandboxExecutor::spawn(TrustMode::Restricted).unwrap();
    let plotter = PlotExecutor::new("codebox-no-such-python", artifacts);
    let dispatcher = Dispatcher::new(sandbox, plotter, Arc::new(EchoLlm), "devstral:24b");
    router(AppState {
        dispatcher: Arc::new(dispatcher),
        config: AppConfig {
            default_model: "devstral:24b".to_owned(),
            models: vec!["devstral:24b".to_owned(), "qwen2.5-coder:7b".to_owned()],
        },
    })
}

async fn post_handle(body: Value) -> (StatusCode, Value) {
    let response = test_router()
        .oneshot(
            Request::post("/api/handle")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn healthz_is_not_cached() {
    let response = test_router()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
}

#[tokio::test]
async fn execute_returns_captured_output() {
    let (status, body) = post_handle(json!({ "code": "print(6 * 7)", "action": "execute" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "text": "42\n", "status": "ok" }));
}

#[tokio::test]
async fn execution_fault_is_reported_with_kind() {
    let (status, body) =
        post_handle(json!({ "code": "raise TypeError('nope')", "action": "execute" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "text": "nope", "status": "error", "fault": "execution" })
    );
}

#[tokio::test]
async fn explain_uses_default_model_when_omitted() {
    let (_, body) = post_handle(json!({ "code": "x = 1", "action": "explain" })).await;
    assert_eq!(body["status"], "ok");
    assert!(body["text"].as_str().unwrap().starts_with("[devstral:24b] "));
    assert!(body.get("image_path").is_none());
}

#[tokio::test]
async fn plot_without_matplotlib_has_no_image() {
    let (_, body) = post_handle(json!({ "code": "pass", "action": "plot", "model": "m" })).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["fault"], "plotting_unavailable");
    assert!(body["text"].as_str().unwrap().starts_with("Error"));
    assert!(body.get("image_url").is_none());
}

#[tokio::test]
async fn unsupported_action_is_an_error_result() {
    let (status, body) = post_handle(json!({ "code": "x", "action": "lint" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fault"], "unsupported_action");
    assert_eq!(body["text"], "Error: unsupported action 'lint'");
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let response = test_router()
        .oneshot(
            Request::post("/api/handle")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"action": "execute"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn unknown_plot_is_not_found() {
    let response = test_router()
        .oneshot(
            Request::get("/api/plots/plot-missing.png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn committed_plot_is_served_as_png() {
    let artifacts = Arc::new(ArtifactStore::new(4).unwrap());
    let path = artifacts.allocate().unwrap();
    let png = b"\x89PNG\r\n\x1a\nfake image".to_vec();
    std::fs::write(&path, &png).unwrap();
    artifacts.commit(path.clone());
    let name = path.file_name().unwrap().to_str().unwrap().to_owned();

    let response = router_with(artifacts)
        .oneshot(
            Request::get(format!("/api/plots/{name}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.to_vec(), png);
}

#[tokio::test]
async fn models_lists_configured_choices() {
    let response = test_router()
        .oneshot(Request::get("/api/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        body,
        json!({ "default": "devstral:24b", "models": ["devstral:24b", "qwen2.5-coder:7b"] })
    );
}
