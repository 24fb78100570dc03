use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use http::Method;
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use request_guard::{
    cache::Cache,
    config::{Settings, StoreBackend},
    guard::Guard,
    metrics::Metrics,
    notify::{Instrumentation, LogSink},
    request::Request,
    rules::Registry,
    service::AdmissionService,
    store::{CacheStore, MemoryStore, RedisStore},
};

#[derive(Clone)]
struct AppState {
    service: Arc<AdmissionService>,
    metrics: Arc<Metrics>,
}

/// Body of `POST /classify`
#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    ip: String,
    #[serde(default = "default_method")]
    method: String,
    path: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "request_guard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting request guard");

    let settings = Settings::load(std::env::var("GUARD_CONFIG").ok().as_deref())?;

    // Initialize components
    let metrics = Arc::new(Metrics::new()?);
    let service = create_service(&settings, metrics.clone()).await?;
    let state = AppState { service, metrics };

    // Load initial rules if provided
    if let Some(rules_path) = &settings.rules_path {
        state.service.load_rules(rules_path).await?;
    }

    let http_addr = settings.http_addr.parse::<SocketAddr>()?;
    let http_server = start_http_server(state.clone(), http_addr);
    info!("HTTP server listening on {}", http_addr);

    // Wait for shutdown signal
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

async fn create_service(settings: &Settings, metrics: Arc<Metrics>) -> Result<Arc<AdmissionService>> {
    let store: Arc<dyn CacheStore> = match settings.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::with_metrics(
            settings.store.memory_capacity,
            metrics.clone(),
        )),
        StoreBackend::Redis => Arc::new(RedisStore::connect(settings.store.redis_config()).await?),
    };
    info!(backend = store.backend(), "cache store ready");

    let cache = Cache::new(store)
        .with_prefix(settings.cache_key_prefix.clone())
        .with_operation_timeout(settings.operation_timeout())
        .with_metrics(metrics.clone());

    let (instrumentation, _worker) = Instrumentation::spawn(Arc::new(LogSink), settings.notify_queue_size);
    let instrumentation = instrumentation.with_metrics(metrics.clone());

    let guard = Guard::new(Arc::new(Registry::default()), cache).with_instrumentation(instrumentation);
    Ok(Arc::new(AdmissionService::new(Arc::new(guard), metrics)))
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let app: Router = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/classify", post(classify))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn classify(
    State(state): State<AppState>,
    Json(body): Json<ClassifyRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let method = Method::from_bytes(body.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let request = body
        .headers
        .iter()
        .fold(Request::new(body.ip, method, body.path), |request, (name, value)| {
            request.with_header(name, value)
        });

    let response = state.service.check(&request).await;
    let retry_after = response
        .headers
        .get(http::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    Ok(Json(json!({
        "status": response.status.as_u16(),
        "forward": response.forward,
        "retry_after": retry_after,
        "decision": response.decision,
    })))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
