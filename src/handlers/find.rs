use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};

use super::ensure_addressable;
use crate::app::AppState;
use crate::filter::FilterData;
use crate::interceptor::Query;
use crate::middleware::{ApiResponse, ApiResult, CurrentTenant};
use crate::tenant::{require_role, Role};

/// POST /api/find/:model - filtered find inside the bound organization
pub async fn find(
    State(state): State<AppState>,
    Extension(CurrentTenant(ctx)): Extension<CurrentTenant>,
    Path(model): Path<String>,
    Json(filter): Json<FilterData>,
) -> ApiResult<Value> {
    require_role(&ctx, Role::User)?;
    ensure_addressable(&state, &model)?;

    let rows = state.client.query(&model, Query::FindMany(filter)).await?;
    Ok(ApiResponse::success(rows))
}

/// POST /api/find/:model/count
pub async fn count(
    State(state): State<AppState>,
    Extension(CurrentTenant(ctx)): Extension<CurrentTenant>,
    Path(model): Path<String>,
    Json(filter): Json<FilterData>,
) -> ApiResult<Value> {
    require_role(&ctx, Role::User)?;
    ensure_addressable(&state, &model)?;

    let count = state.client.query(&model, Query::Count(filter)).await?;
    Ok(ApiResponse::success(json!({ "count": count })))
}
