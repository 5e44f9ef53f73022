use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use orgscope_api::app::{router, AppState};
use orgscope_api::audit::{AuditSink, PgAuditSink, TracingAuditSink};
use orgscope_api::config::config;
use orgscope_api::database::{DatabaseManager, PgQueryClient};
use orgscope_api::interceptor::{ModelRegistry, QueryClient, TenantScopedClient};
use orgscope_api::is_production;
use orgscope_api::jobs::{BulkSyncJob, JobQueue, JobRegistry, JobWorker};
use orgscope_api::tenant::{CachedMembershipStore, JobContextEstablisher, PgMembershipStore, RequestContextEstablisher};

#[derive(Parser, Debug)]
#[command(name = "orgscope-api", version, about = "Multi-tenant API server")]
struct Args {
    /// Port to listen on (overrides ORGSCOPE_API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Apply database migrations before serving
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so DATABASE_URL and APP_ENV are picked up
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = config();
    info!("Starting orgscope-api in {:?} mode", config.environment);
    if is_production!() && !config.tenancy.verify_nested_connect {
        warn!("Nested connect verification is disabled; relation writes will be refused");
    }

    let pool = DatabaseManager::pool().await?;
    if args.migrate || config.database.run_migrations {
        DatabaseManager::migrate().await?;
    }

    let registry = Arc::new(ModelRegistry::standard());
    let raw = PgQueryClient::new(pool.clone(), Arc::clone(&registry));
    let client: Arc<dyn QueryClient> = Arc::new(TenantScopedClient::new(raw, Arc::clone(&registry)));

    // Requests read memberships through a short-lived cache; jobs always go to the table
    let memberships = Arc::new(PgMembershipStore::new(pool.clone()));
    let cached = CachedMembershipStore::new(Arc::clone(&memberships), config.tenancy.membership_cache_ttl());
    let establisher = RequestContextEstablisher::new(Arc::new(cached), config.tenancy.context_refresh_interval());

    let audit: Arc<dyn AuditSink> = if config.security.enable_audit_logging {
        Arc::new(PgAuditSink::new(pool.clone()))
    } else {
        Arc::new(TracingAuditSink)
    };

    let mut jobs = JobRegistry::new();
    jobs.register(BulkSyncJob::new(Arc::clone(&client), Arc::clone(&audit)));
    let jobs = Arc::new(jobs);

    let (queue, receiver) = JobQueue::bounded(config.jobs.queue_capacity);
    let worker = JobWorker::new(JobContextEstablisher::new(memberships), Arc::clone(&jobs), queue.clone());
    tokio::spawn(worker.run(receiver));

    let state = AppState::new(client, registry, establisher, audit, jobs, queue).with_database_health();
    let app = router(state);

    let port = args.port.unwrap_or(config.api.port);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("orgscope-api listening on http://{}", bind_addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    DatabaseManager::close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
}
