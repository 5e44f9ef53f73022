use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::context::Role;
use super::error::TenantError;
use crate::database::manager::DatabaseError;

/// One `(user, organization) -> role` row joined with the organization's slug
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub user_id: String,
    pub organization_id: String,
    pub organization_slug: String,
    pub role: Role,
}

/// Read-only view of the memberships table
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn find_membership(&self, user_id: &str, organization_id: &str) -> Result<Option<Membership>, TenantError>;
}

#[async_trait]
impl<S: MembershipStore + ?Sized> MembershipStore for Arc<S> {
    async fn find_membership(&self, user_id: &str, organization_id: &str) -> Result<Option<Membership>, TenantError> {
        (**self).find_membership(user_id, organization_id).await
    }
}

/// Resolve a membership or fail with `MembershipNotFound`
pub async fn lookup_membership(
    store: &dyn MembershipStore,
    user_id: &str,
    organization_id: &str,
) -> Result<Membership, TenantError> {
    match store.find_membership(user_id, organization_id).await? {
        Some(membership) => Ok(membership),
        None => {
            warn!(user_id, organization_id, "Membership not found");
            Err(TenantError::MembershipNotFound {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
            })
        }
    }
}

pub struct PgMembershipStore {
    pool: PgPool,
}

impl PgMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn find_membership(&self, user_id: &str, organization_id: &str) -> Result<Option<Membership>, TenantError> {
        let query = r#"
            SELECT m.user_id, m.organization_id, m.role, o.slug
            FROM memberships m
            JOIN organizations o ON o.id = m.organization_id
            WHERE m.user_id = $1 AND m.organization_id = $2
        "#;

        let row = sqlx::query(query)
            .bind(user_id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let role: String = row.try_get("role").map_err(DatabaseError::from)?;
        let role = role
            .parse::<Role>()
            .map_err(|e| DatabaseError::QueryError(format!("memberships.role: {}", e)))?;

        Ok(Some(Membership {
            user_id: row.try_get("user_id").map_err(DatabaseError::from)?,
            organization_id: row.try_get("organization_id").map_err(DatabaseError::from)?,
            organization_slug: row.try_get("slug").map_err(DatabaseError::from)?,
            role,
        }))
    }
}

/// Read-through cache over another store.
///
/// Only positive lookups are cached, for exactly `ttl`. A revoked membership keeps
/// authorizing requests for at most `ttl`; jobs must use the inner store directly.
pub struct CachedMembershipStore<S> {
    inner: S,
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), (Membership, Instant)>>,
}

impl<S: MembershipStore> CachedMembershipStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<S: MembershipStore> MembershipStore for CachedMembershipStore<S> {
    async fn find_membership(&self, user_id: &str, organization_id: &str) -> Result<Option<Membership>, TenantError> {
        let key = (user_id.to_string(), organization_id.to_string());

        if let Some((membership, cached_at)) = self.entries.read().await.get(&key) {
            if cached_at.elapsed() < self.ttl {
                debug!(user_id, organization_id, "Membership cache hit");
                return Ok(Some(membership.clone()));
            }
        }

        let found = self.inner.find_membership(user_id, organization_id).await?;
        let mut entries = self.entries.write().await;
        match &found {
            Some(membership) => {
                entries.insert(key, (membership.clone(), Instant::now()));
            }
            None => {
                entries.remove(&key);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryMembershipStore;

    #[tokio::test]
    async fn caches_positive_lookups_within_ttl() {
        let store = Arc::new(MemoryMembershipStore::new());
        store.grant("u1", "org-1", "acme", Role::Admin).await;
        let cached = CachedMembershipStore::new(store.clone(), Duration::from_secs(60));

        cached.find_membership("u1", "org-1").await.unwrap();
        cached.find_membership("u1", "org-1").await.unwrap();
        assert_eq!(store.lookups(), 1);

        // Revocation stays hidden until the entry expires
        store.revoke("u1", "org-1").await;
        assert!(cached.find_membership("u1", "org-1").await.unwrap().is_some());
        assert_eq!(store.lookups(), 1);
    }

    #[tokio::test]
    async fn misses_are_not_cached() {
        let store = Arc::new(MemoryMembershipStore::new());
        let cached = CachedMembershipStore::new(store.clone(), Duration::from_secs(60));

        assert!(cached.find_membership("u1", "org-1").await.unwrap().is_none());
        store.grant("u1", "org-1", "acme", Role::User).await;
        assert!(cached.find_membership("u1", "org-1").await.unwrap().is_some());
        assert_eq!(store.lookups(), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded() {
        let store = Arc::new(MemoryMembershipStore::new());
        store.grant("u1", "org-1", "acme", Role::User).await;
        let cached = CachedMembershipStore::new(store.clone(), Duration::ZERO);

        cached.find_membership("u1", "org-1").await.unwrap();
        store.revoke("u1", "org-1").await;
        assert!(cached.find_membership("u1", "org-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_membership_rejects_absent_rows() {
        let store = MemoryMembershipStore::new();
        let err = lookup_membership(&store, "u1", "org-1").await.unwrap_err();
        assert!(matches!(err, TenantError::MembershipNotFound { .. }));
    }
}
