use axum::http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::context::TenantContext;
use super::error::TenantError;
use super::membership::{lookup_membership, MembershipStore};

pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const USER_HEADER: &str = "x-user-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identity asserted by the upstream authentication layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}

impl RequestMetadata {
    pub fn new(organization_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            organization_id: Some(organization_id.into()),
            user_id: Some(user_id.into()),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            organization_id: read(ORGANIZATION_HEADER),
            user_id: read(USER_HEADER),
            request_id: read(REQUEST_ID_HEADER),
        }
    }
}

/// Turns request metadata into a verified context
#[derive(Clone)]
pub struct RequestContextEstablisher {
    memberships: Arc<dyn MembershipStore>,
    refresh_after: Duration,
}

impl RequestContextEstablisher {
    pub fn new(memberships: Arc<dyn MembershipStore>, refresh_after: Duration) -> Self {
        Self {
            memberships,
            refresh_after,
        }
    }

    pub async fn establish(&self, metadata: &RequestMetadata) -> Result<TenantContext, TenantError> {
        let organization_id = non_empty(&metadata.organization_id).ok_or(TenantError::MissingTenantMetadata("organization id"))?;
        let user_id = non_empty(&metadata.user_id).ok_or(TenantError::MissingTenantMetadata("user id"))?;
        let request_id = non_empty(&metadata.request_id)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let membership = lookup_membership(self.memberships.as_ref(), user_id, organization_id).await?;
        debug!(
            organization_id,
            user_id,
            request_id = %request_id,
            role = %membership.role,
            "Established request context"
        );

        Ok(TenantContext::new(
            membership.organization_id,
            membership.organization_slug,
            membership.user_id,
            membership.role,
            request_id,
        ))
    }

    /// Re-derive role and slug once the context is older than the refresh interval
    pub async fn refresh(&self, ctx: &TenantContext) -> Result<TenantContext, TenantError> {
        if ctx.age() < self.refresh_after {
            return Ok(ctx.clone());
        }

        let membership = lookup_membership(self.memberships.as_ref(), ctx.user_id(), ctx.organization_id()).await?;
        debug!(
            organization_id = ctx.organization_id(),
            user_id = ctx.user_id(),
            request_id = ctx.request_id(),
            role = %membership.role,
            "Refreshed request context"
        );

        Ok(TenantContext::new(
            ctx.organization_id(),
            membership.organization_slug,
            ctx.user_id(),
            membership.role,
            ctx.request_id(),
        ))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
