use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::app::AppState;
use crate::error::ApiError;
use crate::tenant::{run_with_context, RequestMetadata, TenantContext};

/// The context bound for this request, also available through the carrier
#[derive(Clone, Debug)]
pub struct CurrentTenant(pub Arc<TenantContext>);

/// Establishes the tenant context from identity headers and runs the rest of the
/// request with it bound. Nothing downstream runs if establishment fails.
pub async fn tenant_context_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let metadata = RequestMetadata::from_headers(request.headers());
    let ctx = Arc::new(state.establisher.establish(&metadata).await?);

    request.extensions_mut().insert(CurrentTenant(Arc::clone(&ctx)));
    Ok(run_with_context(ctx, next.run(request)).await)
}
