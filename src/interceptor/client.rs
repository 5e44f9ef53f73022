use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::models::ModelRegistry;
use super::query::Query;
use super::scope::{ReferenceCheck, Scoper};
use crate::database::manager::DatabaseError;
use crate::tenant::{current_context_or_none, TenantContext, TenantError};

/// Executes one operation against one model
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query(&self, model: &str, query: Query) -> Result<Value, TenantError>;
}

#[async_trait]
impl<C: QueryClient + ?Sized> QueryClient for Arc<C> {
    async fn query(&self, model: &str, query: Query) -> Result<Value, TenantError> {
        (**self).query(model, query).await
    }
}

/// Wraps a raw client so every operation on a tenant-owned model is scoped to the
/// context bound on the current task, or rejected.
pub struct TenantScopedClient<C> {
    inner: C,
    registry: Arc<ModelRegistry>,
    verify_references: bool,
    slow_query_threshold: Duration,
}

impl<C: QueryClient> TenantScopedClient<C> {
    pub fn new(inner: C, registry: Arc<ModelRegistry>) -> Self {
        let config = crate::config::config();
        Self {
            inner,
            registry,
            verify_references: config.tenancy.verify_nested_connect,
            slow_query_threshold: Duration::from_millis(config.database.slow_query_threshold_ms),
        }
    }

    pub fn with_reference_verification(mut self, enabled: bool) -> Self {
        self.verify_references = enabled;
        self
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    async fn execute(&self, model: &str, query: Query, ctx: Option<&TenantContext>) -> Result<Value, TenantError> {
        let plan = Scoper::new(&self.registry, ctx.map(|c| c.organization_id()), self.verify_references)
            .plan(model, query)?;

        for check in &plan.checks {
            self.verify(check).await?;
        }

        self.inner.query(model, plan.query).await
    }

    async fn verify(&self, check: &ReferenceCheck) -> Result<(), TenantError> {
        // Missing and foreign targets fail the same way
        if self.count(&check.model, check.scoped.clone()).await? == 0 {
            return Err(TenantError::mismatch(&check.model, &check.location));
        }
        Ok(())
    }

    async fn count(&self, model: &str, where_clause: Value) -> Result<u64, TenantError> {
        let value = self.inner.query(model, Query::count(where_clause)).await?;
        value.as_u64().ok_or_else(|| {
            TenantError::Database(DatabaseError::QueryError(format!("count on {} returned {}", model, value)))
        })
    }
}

#[async_trait]
impl<C: QueryClient> QueryClient for TenantScopedClient<C> {
    async fn query(&self, model: &str, query: Query) -> Result<Value, TenantError> {
        let ctx = current_context_or_none();
        let operation = query.operation();
        let started = Instant::now();

        let result = self.execute(model, query, ctx.as_deref()).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let organization_id = ctx.as_ref().map(|c| c.organization_id()).unwrap_or("-");
        let user_id = ctx.as_ref().map(|c| c.user_id()).unwrap_or("-");
        let request_id = ctx.as_ref().map(|c| c.request_id()).unwrap_or("-");

        match &result {
            Ok(_) => {
                debug!(model, operation = %operation, organization_id, user_id, request_id, duration_ms, "Query completed");
                if started.elapsed() > self.slow_query_threshold {
                    warn!(model, operation = %operation, organization_id, user_id, request_id, duration_ms, "Slow query");
                }
            }
            Err(e) => {
                error!(
                    model,
                    operation = %operation,
                    organization_id,
                    user_id,
                    request_id,
                    duration_ms,
                    error = %e,
                    "Query rejected or failed"
                );
            }
        }
        result
    }
}
