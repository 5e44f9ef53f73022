// HTTP API Error Types
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::database::manager::DatabaseError;
use crate::filter::FilterError;
use crate::jobs::JobError;
use crate::tenant::TenantError;

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug)]
pub enum ApiError {
    // 400 Bad Request
    BadRequest(String),
    InvalidJson(String),

    // 401 Unauthorized
    Unauthorized(String),

    // 403 Forbidden
    Forbidden(String),

    // 404 Not Found
    NotFound(String),

    // 500 Internal Server Error
    InternalServerError(String),

    // 503 Service Unavailable
    ServiceUnavailable(String),
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::InvalidJson(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::InternalServerError(_) => 500,
            ApiError::ServiceUnavailable(_) => 503,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::InvalidJson(msg) => msg,
            ApiError::Unauthorized(msg) => msg,
            ApiError::Forbidden(msg) => msg,
            ApiError::NotFound(msg) => msg,
            ApiError::InternalServerError(msg) => msg,
            ApiError::ServiceUnavailable(msg) => msg,
        }
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        json!({
            "error": true,
            "message": self.message(),
            "code": self.error_code()
        })
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::InvalidJson(_) => "INVALID_JSON",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn invalid_json(message: impl Into<String>) -> Self {
        ApiError::InvalidJson(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        ApiError::ServiceUnavailable(message.into())
    }

    /// Same body whether the record is absent or belongs to another organization
    pub fn record_not_found() -> Self {
        ApiError::not_found("Record not found")
    }
}

impl From<TenantError> for ApiError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::MissingTenantMetadata(header) => {
                ApiError::unauthorized(format!("Missing tenant metadata: {}", header))
            }
            // Never tell the caller which part failed or whether the organization exists
            TenantError::MembershipNotFound { .. }
            | TenantError::TenantMismatch { .. }
            | TenantError::RoleInsufficient { .. } => {
                tracing::warn!(kind = err.kind(), error = %err, "Access denied");
                ApiError::forbidden("Access denied")
            }
            TenantError::DisallowedOperation { .. }
            | TenantError::InvalidJobPayload(_)
            | TenantError::InvalidRecord(_) => {
                ApiError::bad_request(err.to_string())
            }
            TenantError::Filter(e) => e.into(),
            TenantError::ContextMissing => {
                tracing::error!("Tenant-scoped operation reached without a bound context");
                ApiError::internal_server_error("An error occurred while processing your request")
            }
            TenantError::Database(e) => e.into(),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => {
                tracing::debug!("Not found: {}", msg);
                ApiError::record_not_found()
            }
            e if e.is_transient() => {
                tracing::error!("Database unavailable: {}", e);
                ApiError::service_unavailable("Database temporarily unavailable")
            }
            DatabaseError::QueryError(msg) => {
                // Don't expose internal SQL errors to clients
                tracing::error!("Database query error: {}", msg);
                ApiError::internal_server_error("An error occurred while processing your request")
            }
            DatabaseError::Migration(e) => {
                tracing::error!("Migration error: {}", e);
                ApiError::service_unavailable("Service is being updated, please try again later")
            }
            e => {
                tracing::error!("Database error: {}", e);
                ApiError::internal_server_error("Database error occurred")
            }
        }
    }
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        ApiError::bad_request(format!("Invalid query: {}", err))
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        tracing::error!("Job enqueue failed: {}", err);
        ApiError::service_unavailable("Job queue unavailable")
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::Role;

    #[test]
    fn authorization_failures_share_one_message() {
        let errors = [
            TenantError::MembershipNotFound {
                user_id: "u1".into(),
                organization_id: "globex".into(),
            },
            TenantError::mismatch("clusters", "data"),
            TenantError::RoleInsufficient {
                actual: Role::User,
                required: Role::Admin,
            },
        ];
        for err in errors {
            let api: ApiError = err.into();
            assert_eq!(api.status_code(), 403);
            assert_eq!(api.message(), "Access denied");
        }
    }

    #[test]
    fn tenant_error_statuses() {
        let status = |err: TenantError| ApiError::from(err).status_code();
        assert_eq!(status(TenantError::MissingTenantMetadata("x-user-id")), 401);
        assert_eq!(status(TenantError::disallowed("clusters", "findUnique", "no key")), 400);
        assert_eq!(status(TenantError::InvalidJobPayload("bad".into())), 400);
        assert_eq!(status(TenantError::InvalidRecord("not an object".into())), 400);
        assert_eq!(status(TenantError::ContextMissing), 500);
        assert_eq!(status(TenantError::Database(DatabaseError::NotFound("clusters".into()))), 404);
        assert_eq!(status(TenantError::Database(DatabaseError::Sqlx(sqlx::Error::PoolTimedOut))), 503);
        assert_eq!(status(TenantError::Database(DatabaseError::QueryError("boom".into()))), 500);
    }

    #[test]
    fn json_body_shape() {
        let body = ApiError::record_not_found().to_json();
        assert_eq!(body, json!({"error": true, "message": "Record not found", "code": "NOT_FOUND"}));
    }
}
