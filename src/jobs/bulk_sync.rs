use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::{JobError, JobHandler};
use crate::audit::AuditSink;
use crate::interceptor::{Query, QueryClient};
use crate::tenant::{current_context, require_role, EstablishedJob, Role};

pub const BULK_SYNC: &str = "bulk_sync";

/// Records a bulk operation for the job's organization and snapshots its cluster count.
///
/// Every query goes through the scoped client, so the row is stamped from the bound
/// context rather than from anything in the payload.
pub struct BulkSyncJob {
    client: Arc<dyn QueryClient>,
    audit: Arc<dyn AuditSink>,
}

impl BulkSyncJob {
    pub fn new(client: Arc<dyn QueryClient>, audit: Arc<dyn AuditSink>) -> Self {
        Self { client, audit }
    }
}

#[async_trait]
impl JobHandler for BulkSyncJob {
    fn action(&self) -> &'static str {
        BULK_SYNC
    }

    async fn run(&self, job_id: &str, job: &EstablishedJob) -> Result<Value, JobError> {
        let ctx = current_context()?;
        require_role(&ctx, Role::ReadWrite)?;

        let operation = self
            .client
            .query(
                "bulk_operations",
                Query::create(json!({
                    "user_id": ctx.user_id(),
                    "action": BULK_SYNC,
                    "status": "completed",
                    "job_id": job_id,
                    "details": Value::Object(job.payload.args.clone()),
                }))?,
            )
            .await?;
        let operation_id = operation.get("id").and_then(Value::as_str).map(str::to_string);

        let clusters = self
            .client
            .query("clusters", Query::count(Value::Null))
            .await?
            .as_u64()
            .unwrap_or(0);

        self.audit
            .record(
                &ctx,
                BULK_SYNC,
                "bulk_operations",
                operation_id.as_deref(),
                json!({ "job_id": job_id, "clusters": clusters }),
            )
            .await?;

        info!(
            job_id,
            organization_id = ctx.organization_id(),
            clusters,
            "Bulk sync recorded"
        );

        Ok(json!({ "bulk_operation_id": operation_id, "clusters": clusters }))
    }
}
