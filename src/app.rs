use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::audit::AuditSink;
use crate::database::DatabaseManager;
use crate::handlers;
use crate::interceptor::{ModelRegistry, QueryClient};
use crate::jobs::{JobQueue, JobRegistry};
use crate::middleware::tenant_context_middleware;
use crate::tenant::RequestContextEstablisher;

/// Shared handler state. `client` is always the tenant-scoped client; handlers never
/// see the raw database client.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn QueryClient>,
    pub registry: Arc<ModelRegistry>,
    pub establisher: Arc<RequestContextEstablisher>,
    pub audit: Arc<dyn AuditSink>,
    pub jobs: Arc<JobRegistry>,
    pub queue: JobQueue,
    pub database_health: bool,
}

impl AppState {
    pub fn new(
        client: Arc<dyn QueryClient>,
        registry: Arc<ModelRegistry>,
        establisher: RequestContextEstablisher,
        audit: Arc<dyn AuditSink>,
        jobs: Arc<JobRegistry>,
        queue: JobQueue,
    ) -> Self {
        Self {
            client,
            registry,
            establisher: Arc::new(establisher),
            audit,
            jobs,
            queue,
            database_health: false,
        }
    }

    /// Report the shared pool in `/health`
    pub fn with_database_health(mut self) -> Self {
        self.database_health = true;
        self
    }
}

pub fn router(state: AppState) -> Router {
    let config = crate::config::config();

    // route_layer: unmatched paths stay 404 instead of failing tenant establishment
    let api = Router::new()
        .merge(auth_routes())
        .merge(data_routes())
        .merge(find_routes())
        .merge(job_routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), tenant_context_middleware));

    let mut app = Router::new()
        // Public
        .route("/", get(root))
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.api.max_request_size_bytes));

    if config.security.enable_cors {
        app = app.layer(cors_layer(&config.security.cors_origins));
    }
    if config.api.enable_request_logging {
        app = app.layer(TraceLayer::new_for_http());
    }
    app
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::permissive().allow_origin(allowed)
}

fn auth_routes() -> Router<AppState> {
    Router::new().route("/api/auth/whoami", get(handlers::auth::whoami))
}

fn data_routes() -> Router<AppState> {
    use handlers::data;

    Router::new()
        .route("/api/data/:model", get(data::list).post(data::create))
        .route(
            "/api/data/:model/:id",
            get(data::get).patch(data::update).delete(data::delete),
        )
}

fn find_routes() -> Router<AppState> {
    use handlers::find;

    Router::new()
        .route("/api/find/:model", post(find::find))
        .route("/api/find/:model/count", post(find::count))
}

fn job_routes() -> Router<AppState> {
    Router::new().route("/api/jobs/:action", post(handlers::jobs::enqueue))
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "name": "orgscope-api",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Multi-tenant backend with tenant-scoped data access",
            "models": state.registry.tenant_models(),
            "jobs": state.jobs.actions(),
            "endpoints": {
                "auth": "/api/auth/whoami",
                "data": "/api/data/:model[/:id]",
                "find": "/api/find/:model[/count]",
                "jobs": "/api/jobs/:action",
            },
            "headers": ["x-organization-id", "x-user-id", "x-request-id"],
        }
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    let now = chrono::Utc::now();

    if !state.database_health {
        return Json(json!({
            "success": true,
            "data": { "status": "ok", "timestamp": now }
        }))
        .into_response();
    }

    match DatabaseManager::health_check().await {
        Ok(_) => Json(json!({
            "success": true,
            "data": { "status": "ok", "timestamp": now, "database": "ok" }
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "error": "database unavailable",
                "data": {
                    "status": "degraded",
                    "timestamp": now,
                    "database_error": e.to_string()
                }
            })),
        )
            .into_response(),
    }
}
