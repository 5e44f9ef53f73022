use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::context::TenantContext;
use super::error::TenantError;
use super::membership::{lookup_membership, MembershipStore};

/// Validated job payload. Fields beyond the three required ones are job arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub organization_id: String,
    pub user_id: String,
    pub action: String,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl JobPayload {
    pub fn new(organization_id: impl Into<String>, user_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            action: action.into(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Validates the shape before anything else runs
    pub fn parse(raw: &Value) -> Result<Self, TenantError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| TenantError::InvalidJobPayload("payload must be a JSON object".to_string()))?;

        let required = |key: &str| -> Result<String, TenantError> {
            match obj.get(key) {
                Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
                Some(Value::String(_)) => Err(TenantError::InvalidJobPayload(format!("{} must not be empty", key))),
                Some(_) => Err(TenantError::InvalidJobPayload(format!("{} must be a string", key))),
                None => Err(TenantError::InvalidJobPayload(format!("{} is required", key))),
            }
        };

        let organization_id = required("organizationId")?;
        let user_id = required("userId")?;
        let action = required("action")?;
        let args = obj
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "organizationId" | "userId" | "action"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            organization_id,
            user_id,
            action,
            args,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut obj = self.args.clone();
        obj.insert("organizationId".to_string(), Value::String(self.organization_id.clone()));
        obj.insert("userId".to_string(), Value::String(self.user_id.clone()));
        obj.insert("action".to_string(), Value::String(self.action.clone()));
        Value::Object(obj)
    }
}

#[derive(Debug, Clone)]
pub struct EstablishedJob {
    pub context: TenantContext,
    pub payload: JobPayload,
}

/// Builds a fresh context for every dequeued attempt.
///
/// Give it the uncached membership store: a revocation between enqueue and
/// execution must stop the job before its body runs.
#[derive(Clone)]
pub struct JobContextEstablisher {
    memberships: Arc<dyn MembershipStore>,
}

impl JobContextEstablisher {
    pub fn new(memberships: Arc<dyn MembershipStore>) -> Self {
        Self { memberships }
    }

    pub async fn establish(&self, job_id: &str, attempt: u32, raw_payload: &Value) -> Result<EstablishedJob, TenantError> {
        let payload = JobPayload::parse(raw_payload)?;
        let membership = lookup_membership(self.memberships.as_ref(), &payload.user_id, &payload.organization_id).await?;

        let request_id = format!("job:{}:{}:{}", job_id, attempt, Uuid::new_v4());
        debug!(
            job_id,
            attempt,
            organization_id = %payload.organization_id,
            user_id = %payload.user_id,
            action = %payload.action,
            "Established job context"
        );

        let context = TenantContext::new(
            membership.organization_id,
            membership.organization_slug,
            membership.user_id,
            membership.role,
            request_id,
        );
        Ok(EstablishedJob { context, payload })
    }
}
