pub mod auth;
pub mod data;
pub mod find;
pub mod jobs;

use crate::app::AppState;
use crate::error::ApiError;
use crate::interceptor::WriteAccess;

/// Only registered tenant-owned models are reachable over HTTP
pub(crate) fn ensure_addressable(state: &AppState, model: &str) -> Result<(), ApiError> {
    if state.registry.is_tenant_owned(model) {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("Model '{}' not found", model)))
    }
}

/// Audit and job bookkeeping tables are readable but never written over HTTP
pub(crate) fn ensure_writable(state: &AppState, model: &str) -> Result<(), ApiError> {
    ensure_addressable(state, model)?;
    match state.registry.write_access(model) {
        WriteAccess::Open => Ok(()),
        WriteAccess::Internal | WriteAccess::None => Err(ApiError::forbidden(format!("Model '{}' is read-only", model))),
    }
}
