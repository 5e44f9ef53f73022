//! In-memory doubles for the database-facing traits. Used by unit and integration
//! tests; nothing here needs a live database.

mod query_client;

pub use query_client::{matches, MemoryQueryClient};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::RwLock;

use crate::audit::{AuditEntry, AuditSink};
use crate::tenant::{Membership, MembershipStore, Role, TenantContext, TenantError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Membership table with grant/revoke and a lookup counter
#[derive(Default)]
pub struct MemoryMembershipStore {
    memberships: RwLock<HashMap<(String, String), Membership>>,
    lookups: AtomicUsize,
}

impl MemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the membership for `(user_id, organization_id)`
    pub async fn grant(&self, user_id: &str, organization_id: &str, organization_slug: &str, role: Role) {
        self.memberships.write().await.insert(
            (user_id.to_string(), organization_id.to_string()),
            Membership {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                organization_slug: organization_slug.to_string(),
                role,
            },
        );
    }

    pub async fn revoke(&self, user_id: &str, organization_id: &str) {
        self.memberships
            .write()
            .await
            .remove(&(user_id.to_string(), organization_id.to_string()));
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipStore for MemoryMembershipStore {
    async fn find_membership(&self, user_id: &str, organization_id: &str) -> Result<Option<Membership>, TenantError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .memberships
            .read()
            .await
            .get(&(user_id.to_string(), organization_id.to_string()))
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(
        &self,
        ctx: &TenantContext,
        action: &str,
        resource: &str,
        resource_id: Option<&str>,
        details: Value,
    ) -> Result<(), TenantError> {
        lock(&self.entries).push(AuditEntry::new(ctx, action, resource, resource_id, details));
        Ok(())
    }
}
