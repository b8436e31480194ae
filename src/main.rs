use async_stream::stream;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{Mutex, RwLock};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

mod browser_bridge;
mod capability;
mod config;
mod cookie_refresh;
mod domain;
mod error;
mod interceptor;
mod pipeline;
mod quota;
mod redact;
mod response;
mod rotation;
mod runtime_state;
mod telemetry;

use crate::browser_bridge::HttpBridgeController;
use crate::capability::{Clock, ModelListEntry, PageController, ResponseCapture, SystemClock};
use crate::config::AppConfig;
use crate::cookie_refresh::{CookieRefreshConfig, CookieRefresher};
use crate::domain::ChatCompletionRequest;
use crate::pipeline::{queue_worker::QueueWorker, RequestPipeline, SubmitOutcome};
use crate::quota::QuotaMonitor;
use crate::rotation::RotationCoordinator;
use crate::runtime_state::{RuntimeState, SharedRuntimeState};
use crate::telemetry::{init_metrics, init_tracing, track_http_metrics};

type CancelRegistry = Mutex<HashMap<String, Arc<AtomicBool>>>;

struct AppState {
    cfg: Arc<AppConfig>,
    pipeline: Arc<RequestPipeline>,
    bridge: Arc<HttpBridgeController>,
    model_list: RwLock<Vec<ModelListEntry>>,
    cookie_refresher: Arc<CookieRefresher>,
    quota: Arc<QuotaMonitor>,
    runtime: SharedRuntimeState,
    cancel_registry: CancelRegistry,
    metrics: PrometheusHandle,
}

const OPEN_PATHS: &[&str] = &["/v1/models", "/health", "/docs", "/openapi.json", "/redoc", "/favicon.ico"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Arc::new(AppConfig::from_env()?);
    init_tracing(&cfg);
    let metrics_handle = init_metrics()?;

    let runtime = RuntimeState::shared();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let bridge_base = cfg
        .server_port_info
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", if cfg.stream_port == 0 { 9222 } else { cfg.stream_port }));
    let bridge = Arc::new(HttpBridgeController::new(bridge_base));
    let page: Arc<dyn PageController> = bridge.clone();
    let capture: Arc<dyn ResponseCapture> = bridge.clone();

    let rotation = Arc::new(RotationCoordinator::new(cfg.rotation_config(), runtime.clone()));
    let quota = Arc::new(QuotaMonitor::new(runtime.clone(), cfg.quota_limits()));

    let tool_executor: Option<Arc<dyn pipeline::tools::ToolExecutor>> = cfg.mcp_http_endpoint.clone().map(|endpoint| {
        Arc::new(pipeline::tools::McpHttpExecutor::new(endpoint, Duration::from_secs(cfg.mcp_http_timeout_secs))) as Arc<dyn pipeline::tools::ToolExecutor>
    });

    let (worker, worker_sender) =
        QueueWorker::new(page.clone(), capture, tool_executor, rotation.clone(), quota.clone(), clock.clone(), runtime.clone(), vec![]);
    let worker = Arc::new(worker);
    tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    tokio::spawn({
        let quota = quota.clone();
        let rotation = rotation.clone();
        let page = page.clone();
        let clock = clock.clone();
        async move { quota::run_watchdog(quota, rotation, page, clock).await }
    });

    let cookie_refresher = Arc::new(CookieRefresher::new(
        CookieRefreshConfig {
            enabled: cfg.cookie_refresh_enabled,
            interval_secs: cfg.cookie_refresh_interval_secs,
            on_request_enabled: cfg.cookie_refresh_on_request_enabled,
            request_interval: cfg.cookie_refresh_request_interval_secs,
            on_shutdown: cfg.cookie_refresh_on_shutdown,
            fallback_profile_path: cfg.active_auth_json_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
        },
        page.clone(),
        runtime.clone(),
    ));
    tokio::spawn({
        let cookie_refresher = cookie_refresher.clone();
        let clock = clock.clone();
        async move { cookie_refresher.run_periodic(clock).await }
    });

    if cfg.auto_auth_rotation_on_startup {
        if let Err(err) = rotation.perform(None, page.as_ref(), 0, clock.as_ref()).await {
            tracing::warn!(?err, "startup auth rotation failed, continuing with current profile");
        }
    }

    let pipeline = Arc::new(RequestPipeline::new(runtime.clone(), worker_sender, cfg.response_completion_timeout_secs));

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        pipeline,
        bridge,
        model_list: RwLock::new(vec![]),
        cookie_refresher,
        quota,
        runtime: runtime.clone(),
        cancel_registry: Mutex::new(HashMap::new()),
        metrics: metrics_handle,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/cancel/:req_id", post(cancel_handler))
        .route("/v1/queue", get(queue_handler))
        .route("/metrics", get(metrics_handler))
        .route("/docs", get(|| async { "" }))
        .route("/openapi.json", get(|| async { Json(json!({"openapi": "3.0.0"})) }))
        .route("/redoc", get(|| async { "" }))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state.clone());

    let addr: SocketAddr = state.cfg.listen_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "starting server");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
        term.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received, starting graceful shutdown");
    state.runtime.is_shutting_down.store(true, Ordering::SeqCst);
    state.cookie_refresher.shutdown_save().await;
}

async fn auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let open = OPEN_PATHS.contains(&req.uri().path());
    if open || state.cfg.api_keys.is_empty() {
        return next.run(req).await;
    }
    if api_key_is_valid(req.headers(), &state.cfg.api_keys) {
        next.run(req).await
    } else {
        unauthorized_response()
    }
}

fn api_key_is_valid(headers: &HeaderMap, keys: &[String]) -> bool {
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });
    match presented {
        Some(key) => keys.iter().any(|k| k == &key),
        None => false,
    }
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": "missing or invalid API key",
                "type": "invalid_request_error",
                "param": serde_json::Value::Null,
                "code": "invalid_api_key",
            }
        })),
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render()
}

async fn queue_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "queue_length": state.runtime.queued_request_count.load(Ordering::SeqCst),
        "rotation_in_progress": !state.runtime.rotation_lock.is_set(),
        "quota_exceeded": state.quota.is_exceeded(),
    }))
}

async fn cancel_handler(State(state): State<Arc<AppState>>, Path(req_id): Path<String>) -> impl IntoResponse {
    let registry = state.cancel_registry.lock().await;
    match registry.get(&req_id) {
        Some(flag) => {
            flag.store(false, Ordering::SeqCst);
            (StatusCode::OK, Json(json!({ "cancelled": req_id }))).into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown request id" }))).into_response(),
    }
}

/// Live model list from the bridge, filtered by a small built-in
/// exclusion set; falls back to a single synthetic entry when the
/// upstream list is empty or unreachable.
const EXCLUDED_MODEL_SUBSTRINGS: &[&str] = &["deprecated", "preview-internal"];
const FALLBACK_MODEL_ID: &str = "gemini-pro";

async fn models_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut cached = state.model_list.write().await;
    if cached.is_empty() {
        if let Ok(fetched) = state.bridge.fetch_model_list().await {
            *cached = fetched;
        }
    }

    let visible: Vec<_> = cached
        .iter()
        .filter(|m| !EXCLUDED_MODEL_SUBSTRINGS.iter().any(|bad| m.id.contains(bad)))
        .map(|m| json!({ "id": m.id, "object": "model" }))
        .collect();

    let data = if visible.is_empty() {
        vec![json!({ "id": FALLBACK_MODEL_ID, "object": "model" })]
    } else {
        visible
    };

    Json(json!({ "object": "list", "data": data }))
}

async fn chat_completions_handler(State(state): State<Arc<AppState>>, Json(request): Json<ChatCompletionRequest>) -> Response {
    let req_id = Uuid::new_v4().to_string();
    let model = request.model.clone().unwrap_or_else(|| "default".to_string());
    track_http_metrics("/v1/chat/completions", &model, &req_id);

    let alive_flag = Arc::new(AtomicBool::new(true));
    state.cancel_registry.lock().await.insert(req_id.clone(), alive_flag.clone());
    let is_alive: Arc<dyn Fn() -> bool + Send + Sync> = {
        let alive_flag = alive_flag.clone();
        Arc::new(move || alive_flag.load(Ordering::SeqCst))
    };

    let result = state.pipeline.submit(req_id.clone(), request, is_alive).await;
    state.cancel_registry.lock().await.remove(&req_id);

    match result {
        Ok(SubmitOutcome::NonStreaming(resp)) => {
            state.cookie_refresher.maybe_refresh_on_request().await;
            respond_json_possibly_chunked(&resp)
        }
        Ok(SubmitOutcome::ToolCall { function_name, result }) => {
            state.cookie_refresher.maybe_refresh_on_request().await;
            let created = chrono::Utc::now().timestamp();
            let resp = response::build_local_tool_call_response(&req_id, &model, created, &function_name, &result);
            Json(resp).into_response()
        }
        Ok(SubmitOutcome::Streaming { stream, completion, silence_threshold, model, req_id }) => {
            state.cookie_refresher.maybe_refresh_on_request().await;
            stream_chat_completion(stream, completion, silence_threshold, model, req_id)
        }
        Err(err) => err.into_response(),
    }
}

fn respond_json_possibly_chunked(resp: &crate::domain::ChatCompletionResponse) -> Response {
    let serialized = serde_json::to_string(resp).unwrap_or_else(|_| "{}".to_string());
    if serialized.len() <= response::CHUNK_THRESHOLD_BYTES {
        return Json(resp).into_response();
    }
    let pieces = response::chunk_body(&serialized);
    let body = Body::from_stream(futures::stream::iter(pieces.into_iter().map(Ok::<_, Infallible>)));
    ([(axum::http::header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn stream_chat_completion(
    mut stream: Box<dyn crate::capability::InterceptorStream>,
    completion: Arc<crate::pipeline::disconnect::CompletionEvent>,
    silence_threshold: Duration,
    model: String,
    req_id: String,
) -> Response {
    use crate::capability::InterceptorEvent;

    let created = chrono::Utc::now().timestamp();
    let id = crate::domain::chat_completion_id(&req_id, created);

    let sse = stream! {
        let mut saw_function = false;
        loop {
            let next = tokio::select! {
                _ = completion.wait() => None,
                event = stream.next_event() => event,
                _ = tokio::time::sleep(silence_threshold) => {
                    let chunk = json!({"error": {"message": "response timed out", "type": "server_error", "param": null, "code": req_id}});
                    yield Ok::<_, Infallible>(axum::response::sse::Event::default().data(chunk.to_string()));
                    break;
                }
            };

            match next {
                Some(InterceptorEvent::Body(text)) | Some(InterceptorEvent::Reason(text)) => {
                    let chunk = response::text_chunk(&id, &model, created, text);
                    if let Ok(data) = serde_json::to_string(&chunk) {
                        yield Ok(axum::response::sse::Event::default().data(data));
                    }
                }
                Some(InterceptorEvent::Function { name, arguments }) => {
                    saw_function = true;
                    let chunk = response::function_chunk(&id, &model, created, 0, &name, &arguments);
                    if let Ok(data) = serde_json::to_string(&chunk) {
                        yield Ok(axum::response::sse::Event::default().data(data));
                    }
                }
                Some(InterceptorEvent::Error(message)) => {
                    let chunk = json!({"error": {"message": message, "type": "server_error", "param": null, "code": req_id}});
                    yield Ok(axum::response::sse::Event::default().data(chunk.to_string()));
                    break;
                }
                Some(InterceptorEvent::Done) | None => {
                    let finish_reason = if saw_function { "tool_calls" } else { "stop" };
                    let chunk = response::final_chunk(&id, &model, created, finish_reason, None);
                    if let Ok(data) = serde_json::to_string(&chunk) {
                        yield Ok(axum::response::sse::Event::default().data(data));
                    }
                    yield Ok(axum::response::sse::Event::default().data("[DONE]"));
                    break;
                }
            }
        }
    };

    Sse::new(sse).keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(10))).into_response()
}
