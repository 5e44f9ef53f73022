use thiserror::Error;

use super::context::Role;
use crate::database::manager::DatabaseError;
use crate::filter::FilterError;

/// Failures raised by context establishment, the query interceptor and the role gate.
/// None of these are retried here; the job worker consults `is_retryable`.
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("No tenant context is bound to the current task")]
    ContextMissing,

    #[error("Missing tenant metadata: {0}")]
    MissingTenantMetadata(&'static str),

    #[error("Invalid job payload: {0}")]
    InvalidJobPayload(String),

    // Display stays generic so the message never confirms an organization exists
    #[error("Membership not found")]
    MembershipNotFound { user_id: String, organization_id: String },

    #[error("Organization mismatch on {model} ({location})")]
    TenantMismatch { model: String, location: String },

    #[error("Operation {operation} on {model} is not allowed: {reason}")]
    DisallowedOperation {
        model: String,
        operation: String,
        reason: String,
    },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Role {actual} is insufficient, {required} required")]
    RoleInsufficient { actual: Role, required: Role },

    #[error("Invalid query: {0}")]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl TenantError {
    pub fn mismatch(model: impl Into<String>, location: impl Into<String>) -> Self {
        TenantError::TenantMismatch {
            model: model.into(),
            location: location.into(),
        }
    }

    pub fn disallowed(model: impl Into<String>, operation: impl Into<String>, reason: impl Into<String>) -> Self {
        TenantError::DisallowedOperation {
            model: model.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Only transient infrastructure failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            TenantError::Database(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Short stable name used in logs and job outcomes
    pub fn kind(&self) -> &'static str {
        match self {
            TenantError::ContextMissing => "context_missing",
            TenantError::MissingTenantMetadata(_) => "missing_tenant_metadata",
            TenantError::InvalidJobPayload(_) => "invalid_job_payload",
            TenantError::MembershipNotFound { .. } => "membership_not_found",
            TenantError::TenantMismatch { .. } => "tenant_mismatch",
            TenantError::DisallowedOperation { .. } => "disallowed_operation",
            TenantError::InvalidRecord(_) => "invalid_record",
            TenantError::RoleInsufficient { .. } => "role_insufficient",
            TenantError::Filter(_) => "invalid_query",
            TenantError::Database(_) => "database",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_message_is_generic() {
        let err = TenantError::MembershipNotFound {
            user_id: "u1".into(),
            organization_id: "other-org".into(),
        };
        assert!(!err.to_string().contains("other-org"));
    }

    #[test]
    fn only_transient_database_failures_retry() {
        assert!(TenantError::Database(DatabaseError::Sqlx(sqlx::Error::PoolTimedOut)).is_retryable());
        assert!(!TenantError::ContextMissing.is_retryable());
        assert!(!TenantError::InvalidJobPayload("x".into()).is_retryable());
        assert!(!TenantError::mismatch("clusters", "data").is_retryable());
    }
}
