#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use orgscope_api::interceptor::{ModelRegistry, TenantScopedClient};
use orgscope_api::tenant::{Role, TenantContext};
use orgscope_api::testing::{MemoryMembershipStore, MemoryQueryClient};

pub const ACME: &str = "org-acme";
pub const GLOBEX: &str = "org-globex";

pub type ScopedClient = TenantScopedClient<Arc<MemoryQueryClient>>;

pub fn context(organization_id: &str, user_id: &str, role: Role) -> TenantContext {
    TenantContext::new(
        organization_id,
        organization_id.trim_start_matches("org-"),
        user_id,
        role,
        format!("test:{}:{}", organization_id, user_id),
    )
}

/// Two organizations with overlapping data shapes
pub fn seeded_database() -> Arc<MemoryQueryClient> {
    let db = MemoryQueryClient::new();
    seed(&db);
    Arc::new(db)
}

pub fn seed(db: &MemoryQueryClient) {
    for (id, org, status) in [
        ("c-acme-1", ACME, "active"),
        ("c-acme-2", ACME, "retired"),
        ("c-globex-1", GLOBEX, "active"),
        ("c-globex-2", GLOBEX, "active"),
    ] {
        db.insert_row(
            "clusters",
            json!({"id": id, "organization_id": org, "name": id, "status": status}),
        );
    }
    db.insert_row(
        "deployments",
        json!({"id": "d-acme-1", "organization_id": ACME, "cluster_id": "c-acme-1", "name": "api", "replicas": 2}),
    );
    db.insert_row(
        "deployments",
        json!({"id": "d-globex-1", "organization_id": GLOBEX, "cluster_id": "c-globex-1", "name": "api", "replicas": 3}),
    );
}

pub fn scoped(db: &Arc<MemoryQueryClient>) -> ScopedClient {
    TenantScopedClient::new(Arc::clone(db), Arc::new(ModelRegistry::standard()))
}

pub async fn memberships() -> Arc<MemoryMembershipStore> {
    let store = MemoryMembershipStore::new();
    store.grant("u-admin", ACME, "acme", Role::Admin).await;
    store.grant("u-writer", ACME, "acme", Role::ReadWrite).await;
    store.grant("u-reader", ACME, "acme", Role::User).await;
    store.grant("u-globex", GLOBEX, "globex", Role::Admin).await;
    Arc::new(store)
}

/// `organization_id` of every row in a JSON array result
pub fn organizations(rows: &Value) -> Vec<String> {
    rows.as_array()
        .into_iter()
        .flatten()
        .filter_map(|row| row.get("organization_id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

pub fn rows_of(db: &MemoryQueryClient, model: &str, organization_id: &str) -> Vec<Value> {
    db.rows(model)
        .into_iter()
        .filter(|row| row["organization_id"] == json!(organization_id))
        .collect()
}
