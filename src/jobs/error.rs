use thiserror::Error;

use crate::tenant::TenantError;

/// Job execution outcome; decides whether the worker schedules another attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Retryable error: {0}")]
    Retryable(String),

    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

// Tenant errors are permanent; only transient database failures get another attempt
impl From<TenantError> for JobError {
    fn from(err: TenantError) -> Self {
        if err.is_retryable() {
            JobError::Retryable(err.to_string())
        } else {
            JobError::Permanent(format!("{}: {}", err.kind(), err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseError;

    #[test]
    fn classifies_tenant_errors() {
        let revoked = TenantError::MembershipNotFound {
            user_id: "u1".into(),
            organization_id: "acme".into(),
        };
        assert!(!JobError::from(revoked).is_retryable());
        assert!(JobError::from(TenantError::Database(DatabaseError::Sqlx(sqlx::Error::PoolClosed))).is_retryable());
    }

    #[test]
    fn permanent_message_names_the_kind() {
        let err = JobError::from(TenantError::InvalidJobPayload("action is required".into()));
        assert!(err.message().starts_with("invalid_job_payload"));
    }
}
