use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::{ApiResponse, ApiResult, CurrentTenant};
use crate::tenant::{require_role, JobPayload, Role};

/// POST /api/jobs/:action - enqueue background work for the bound organization and user.
///
/// Identity comes from the context, never the body; the worker re-checks membership
/// when the job is picked up.
pub async fn enqueue(
    State(state): State<AppState>,
    Extension(CurrentTenant(ctx)): Extension<CurrentTenant>,
    Path(action): Path<String>,
    body: Option<Json<Value>>,
) -> ApiResult<Value> {
    require_role(&ctx, Role::ReadWrite)?;
    if !state.jobs.contains(&action) {
        return Err(ApiError::not_found(format!("Job action '{}' not found", action)));
    }

    let mut payload = JobPayload::new(ctx.organization_id(), ctx.user_id(), action.as_str());
    match body.map(|Json(value)| value) {
        None | Some(Value::Null) => {}
        Some(Value::Object(mut args)) => {
            args.retain(|key, _| !matches!(key.as_str(), "organizationId" | "userId" | "action"));
            payload.args = args;
        }
        Some(_) => return Err(ApiError::invalid_json("Job arguments must be a JSON object")),
    }

    let job_id = state.queue.enqueue(&payload).await?;
    Ok(ApiResponse::accepted(json!({ "job_id": job_id, "action": action })))
}
