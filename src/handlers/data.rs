use axum::{
    extract::{Path, Query as QueryString, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use super::{ensure_addressable, ensure_writable};
use crate::app::AppState;
use crate::error::ApiError;
use crate::filter::FilterData;
use crate::interceptor::{Query, UniqueWhere, ORG_COLUMN};
use crate::middleware::{ApiResponse, ApiResult, CurrentTenant};
use crate::tenant::{require_role, run_with_context, Role, TenantContext};

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

/// GET /api/data/:model - list records of the bound organization
pub async fn list(
    State(state): State<AppState>,
    Extension(CurrentTenant(ctx)): Extension<CurrentTenant>,
    Path(model): Path<String>,
    QueryString(params): QueryString<ListParams>,
) -> ApiResult<Value> {
    require_role(&ctx, Role::User)?;
    ensure_addressable(&state, &model)?;

    let filter = FilterData {
        limit: params.limit,
        offset: params.offset,
        ..Default::default()
    };
    let rows = state.client.query(&model, Query::FindMany(filter)).await?;
    Ok(ApiResponse::success(rows))
}

/// POST /api/data/:model - create one record, stamped with the bound organization
pub async fn create(
    State(state): State<AppState>,
    Extension(CurrentTenant(ctx)): Extension<CurrentTenant>,
    Path(model): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    require_role(&ctx, Role::ReadWrite)?;
    ensure_writable(&state, &model)?;
    if !body.is_object() {
        return Err(ApiError::invalid_json("Request body must be a JSON object"));
    }

    let ctx = revalidate(&state, &ctx, Role::ReadWrite).await?;
    let query = Query::create(body)?;
    let row = run_with_context(Arc::clone(&ctx), state.client.query(&model, query)).await?;
    audit(&state, &ctx, "create", &model, &row).await;
    Ok(ApiResponse::created(row))
}

/// GET /api/data/:model/:id
pub async fn get(
    State(state): State<AppState>,
    Extension(CurrentTenant(ctx)): Extension<CurrentTenant>,
    Path((model, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    require_role(&ctx, Role::User)?;
    ensure_addressable(&state, &model)?;

    let key = UniqueWhere::compound([("id", id), (ORG_COLUMN, ctx.organization_id().to_string())]);
    let row = state.client.query(&model, Query::FindUnique(key)).await?;
    found(row).map(ApiResponse::success)
}

/// PATCH /api/data/:model/:id
pub async fn update(
    State(state): State<AppState>,
    Extension(CurrentTenant(ctx)): Extension<CurrentTenant>,
    Path((model, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    require_role(&ctx, Role::ReadWrite)?;
    ensure_writable(&state, &model)?;
    if !body.is_object() {
        return Err(ApiError::invalid_json("Request body must be a JSON object"));
    }

    let ctx = revalidate(&state, &ctx, Role::ReadWrite).await?;
    let query = Query::update(json!({ "id": id }), body)?;
    let row = found(run_with_context(Arc::clone(&ctx), state.client.query(&model, query)).await?)?;
    audit(&state, &ctx, "update", &model, &row).await;
    Ok(ApiResponse::success(row))
}

/// DELETE /api/data/:model/:id
pub async fn delete(
    State(state): State<AppState>,
    Extension(CurrentTenant(ctx)): Extension<CurrentTenant>,
    Path((model, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    require_role(&ctx, Role::Admin)?;
    ensure_writable(&state, &model)?;

    let ctx = revalidate(&state, &ctx, Role::Admin).await?;
    let query = Query::Delete {
        where_clause: json!({ "id": id }),
    };
    let row = found(run_with_context(Arc::clone(&ctx), state.client.query(&model, query)).await?)?;
    audit(&state, &ctx, "delete", &model, &row).await;
    Ok(ApiResponse::success(row))
}

// Absent here and present in another organization look identical to the caller
fn found(row: Value) -> Result<Value, ApiError> {
    match row {
        Value::Null => Err(ApiError::record_not_found()),
        row => Ok(row),
    }
}

/// Re-check the membership before an audited write once the context is older than
/// the refresh interval. The write runs under the returned context.
async fn revalidate(state: &AppState, ctx: &TenantContext, required: Role) -> Result<Arc<TenantContext>, ApiError> {
    let ctx = state.establisher.refresh(ctx).await?;
    require_role(&ctx, required)?;
    Ok(Arc::new(ctx))
}

// The write has already been applied, so a sink failure is logged and the caller still
// gets the result
async fn audit(state: &AppState, ctx: &TenantContext, action: &str, model: &str, row: &Value) {
    let resource_id = row.get("id").and_then(Value::as_str);
    if let Err(e) = state.audit.record(ctx, action, model, resource_id, json!({})).await {
        error!(
            organization_id = ctx.organization_id(),
            user_id = ctx.user_id(),
            request_id = ctx.request_id(),
            action,
            resource = model,
            resource_id,
            error = %e,
            "Audit entry not recorded"
        );
    }
}
