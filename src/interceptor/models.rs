use std::collections::HashMap;

/// Column carrying the owning organization on every tenant-owned table
pub const ORG_COLUMN: &str = "organization_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Foreign key lives on this model
    BelongsTo,
    /// Foreign key lives on the target model
    HasMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    pub foreign_key: String,
}

/// Who may write rows of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAccess {
    /// Any scoped caller, including the HTTP data routes
    Open,
    /// Service code only (job handlers); read-only over HTTP
    Internal,
    /// Never through a query client; a dedicated writer such as the audit sink owns the table
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDef {
    pub name: String,
    pub tenant_owned: bool,
    pub writes: WriteAccess,
    pub relations: Vec<Relation>,
}

impl ModelDef {
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Known models and the relations nested writes may follow.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelDef>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant_model(mut self, name: &str) -> Self {
        self.insert(name, true, WriteAccess::Open);
        self
    }

    /// Tenant-owned, written only by service code
    pub fn internal_model(mut self, name: &str) -> Self {
        self.insert(name, true, WriteAccess::Internal);
        self
    }

    /// Tenant-owned, never written through a query client
    pub fn sink_model(mut self, name: &str) -> Self {
        self.insert(name, true, WriteAccess::None);
        self
    }

    pub fn shared_model(mut self, name: &str) -> Self {
        self.insert(name, false, WriteAccess::Open);
        self
    }

    pub fn belongs_to(mut self, model: &str, relation: &str, target: &str, foreign_key: &str) -> Self {
        self.add_relation(model, relation, target, RelationKind::BelongsTo, foreign_key);
        self
    }

    pub fn has_many(mut self, model: &str, relation: &str, target: &str, foreign_key: &str) -> Self {
        self.add_relation(model, relation, target, RelationKind::HasMany, foreign_key);
        self
    }

    fn insert(&mut self, name: &str, tenant_owned: bool, writes: WriteAccess) {
        self.models.insert(
            name.to_string(),
            ModelDef {
                name: name.to_string(),
                tenant_owned,
                writes,
                relations: vec![],
            },
        );
    }

    fn add_relation(&mut self, model: &str, relation: &str, target: &str, kind: RelationKind, foreign_key: &str) {
        let def = self.models.entry(model.to_string()).or_insert_with(|| ModelDef {
            name: model.to_string(),
            tenant_owned: false,
            writes: WriteAccess::Open,
            relations: vec![],
        });
        def.relations.push(Relation {
            name: relation.to_string(),
            target: target.to_string(),
            kind,
            foreign_key: foreign_key.to_string(),
        });
    }

    pub fn model(&self, name: &str) -> Option<&ModelDef> {
        self.models.get(name)
    }

    pub fn is_tenant_owned(&self, name: &str) -> bool {
        self.models.get(name).map(|m| m.tenant_owned).unwrap_or(false)
    }

    /// Unknown models are treated as open, like any other non-tenant model
    pub fn write_access(&self, name: &str) -> WriteAccess {
        self.models.get(name).map(|m| m.writes).unwrap_or(WriteAccess::Open)
    }

    pub fn tenant_models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .models
            .values()
            .filter(|m| m.tenant_owned)
            .map(|m| m.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// The deployed schema: see migrations/0001_tenancy.sql
    pub fn standard() -> Self {
        Self::new()
            .shared_model("organizations")
            .shared_model("users")
            .shared_model("memberships")
            .tenant_model("clusters")
            .tenant_model("deployments")
            .internal_model("bulk_operations")
            .sink_model("audit_logs")
            .tenant_model("alert_rules")
            .has_many("clusters", "deployments", "deployments", "cluster_id")
            .has_many("clusters", "alert_rules", "alert_rules", "cluster_id")
            .belongs_to("deployments", "cluster", "clusters", "cluster_id")
            .belongs_to("alert_rules", "cluster", "clusters", "cluster_id")
            .belongs_to("audit_logs", "user", "users", "user_id")
            .has_many("users", "audit_logs", "audit_logs", "user_id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_tenant_models() {
        let registry = ModelRegistry::standard();
        assert_eq!(
            registry.tenant_models(),
            vec!["alert_rules", "audit_logs", "bulk_operations", "clusters", "deployments"]
        );
        assert!(!registry.is_tenant_owned("users"));
        assert!(!registry.is_tenant_owned("unknown"));
    }

    #[test]
    fn relations_resolve() {
        let registry = ModelRegistry::standard();
        let relation = registry.model("clusters").and_then(|m| m.relation("deployments")).unwrap();
        assert_eq!(relation.kind, RelationKind::HasMany);
        assert_eq!(relation.foreign_key, "cluster_id");
        assert!(registry.model("deployments").unwrap().relation("nope").is_none());
    }

    #[test]
    fn write_access_levels() {
        let registry = ModelRegistry::standard();
        assert_eq!(registry.write_access("clusters"), WriteAccess::Open);
        assert_eq!(registry.write_access("bulk_operations"), WriteAccess::Internal);
        assert_eq!(registry.write_access("audit_logs"), WriteAccess::None);
        assert_eq!(registry.write_access("users"), WriteAccess::Open);
        assert!(registry.is_tenant_owned("audit_logs"));
    }
}
