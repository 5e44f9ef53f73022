use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::database::manager::DatabaseError;
use crate::tenant::{TenantContext, TenantError};

/// One accepted, completed operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub request_id: String,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(ctx: &TenantContext, action: &str, resource: &str, resource_id: Option<&str>, details: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            organization_id: ctx.organization_id().to_string(),
            user_id: ctx.user_id().to_string(),
            request_id: ctx.request_id().to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            resource_id: resource_id.map(str::to_string),
            details,
            created_at: Utc::now(),
        }
    }
}

/// Called explicitly by handlers and jobs after a successful operation.
/// Entries are stamped from the context, never from caller data.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(
        &self,
        ctx: &TenantContext,
        action: &str,
        resource: &str,
        resource_id: Option<&str>,
        details: Value,
    ) -> Result<(), TenantError>;
}

#[async_trait]
impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    async fn record(
        &self,
        ctx: &TenantContext,
        action: &str,
        resource: &str,
        resource_id: Option<&str>,
        details: Value,
    ) -> Result<(), TenantError> {
        (**self).record(ctx, action, resource, resource_id, details).await
    }
}

/// Writes straight into `audit_logs`, outside the query interceptor
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(
        &self,
        ctx: &TenantContext,
        action: &str,
        resource: &str,
        resource_id: Option<&str>,
        details: Value,
    ) -> Result<(), TenantError> {
        let entry = AuditEntry::new(ctx, action, resource, resource_id, details);
        let query = r#"
            INSERT INTO audit_logs
                (id, organization_id, user_id, request_id, action, resource, resource_id, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#;

        sqlx::query(query)
            .bind(&entry.id)
            .bind(&entry.organization_id)
            .bind(&entry.user_id)
            .bind(&entry.request_id)
            .bind(&entry.action)
            .bind(&entry.resource)
            .bind(&entry.resource_id)
            .bind(sqlx::types::Json(&entry.details))
            .bind(entry.created_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        Ok(())
    }
}

/// Emits entries on the `audit` log target only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(
        &self,
        ctx: &TenantContext,
        action: &str,
        resource: &str,
        resource_id: Option<&str>,
        details: Value,
    ) -> Result<(), TenantError> {
        info!(
            target: "audit",
            organization_id = ctx.organization_id(),
            user_id = ctx.user_id(),
            request_id = ctx.request_id(),
            action,
            resource,
            resource_id = resource_id.unwrap_or("-"),
            details = %details,
            "audit"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::Role;
    use serde_json::json;

    #[test]
    fn entry_is_stamped_from_context() {
        let ctx = TenantContext::new("org-acme", "acme", "u1", Role::Admin, "req-9");
        let entry = AuditEntry::new(&ctx, "delete", "clusters", Some("c1"), json!({"reason": "cleanup"}));
        assert_eq!(entry.organization_id, "org-acme");
        assert_eq!(entry.request_id, "req-9");
        assert_eq!(entry.resource_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn tracing_sink_accepts_entries() {
        let ctx = TenantContext::new("org-acme", "acme", "u1", Role::User, "req-1");
        assert!(TracingAuditSink.record(&ctx, "read", "clusters", None, Value::Null).await.is_ok());
    }
}
