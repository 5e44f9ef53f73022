use axum::Extension;

use crate::middleware::{ApiResponse, ApiResult, CurrentTenant};
use crate::tenant::TenantContext;

/// GET /api/auth/whoami - the context bound for this request
pub async fn whoami(Extension(CurrentTenant(ctx)): Extension<CurrentTenant>) -> ApiResult<TenantContext> {
    Ok(ApiResponse::success(ctx.as_ref().clone()))
}
