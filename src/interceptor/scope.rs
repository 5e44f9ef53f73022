//! Pure rewriting of a `Query` against the bound organization.
//!
//! Planning never touches the database: anything that needs a lookup (connect targets,
//! foreign keys into tenant-owned models) comes back as a `ReferenceCheck` for the
//! client to run before the rewritten query executes.

use serde_json::{Map, Value};
use tracing::warn;

use super::models::{ModelRegistry, Relation, RelationKind, WriteAccess, ORG_COLUMN};
use super::query::{Query, Record, UniqueWhere};
use crate::filter::FilterData;
use crate::tenant::TenantError;

/// A referenced row that must exist inside the bound organization
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCheck {
    pub model: String,
    pub scoped: Value,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopePlan {
    pub query: Query,
    pub checks: Vec<ReferenceCheck>,
}

pub struct Scoper<'a> {
    registry: &'a ModelRegistry,
    organization_id: Option<&'a str>,
    verify_references: bool,
    operation: &'static str,
    checks: Vec<ReferenceCheck>,
}

impl<'a> Scoper<'a> {
    pub fn new(registry: &'a ModelRegistry, organization_id: Option<&'a str>, verify_references: bool) -> Self {
        Self {
            registry,
            organization_id,
            verify_references,
            operation: "",
            checks: vec![],
        }
    }

    pub fn plan(mut self, model: &str, query: Query) -> Result<ScopePlan, TenantError> {
        let tenant_owned = self.registry.is_tenant_owned(model);
        if tenant_owned {
            self.organization()?;
        }
        self.operation = query.operation().as_str();
        if query.operation().is_write() {
            self.check_writable(model)?;
        }

        let query = match query {
            Query::FindMany(filter) => Query::FindMany(self.scope_filter(model, filter)?),
            Query::FindFirst(filter) => Query::FindFirst(self.scope_filter(model, filter)?),
            Query::FindUnique(key) => {
                if tenant_owned {
                    self.check_unique(model, &key)?;
                }
                Query::FindUnique(key)
            }
            Query::Count(filter) => Query::Count(self.scope_filter(model, filter)?),
            Query::Aggregate { filter, function, field } => Query::Aggregate {
                filter: self.scope_filter(model, filter)?,
                function,
                field,
            },
            Query::GroupBy { filter, by } => Query::GroupBy {
                filter: self.scope_filter(model, filter)?,
                by,
            },
            Query::Create(record) => Query::Create(self.create_record(model, record, "data")?),
            Query::CreateMany(records) => Query::CreateMany(
                records
                    .into_iter()
                    .enumerate()
                    .map(|(i, record)| self.create_record(model, record, &format!("data[{}]", i)))
                    .collect::<Result<_, _>>()?,
            ),
            Query::Update { where_clause, data } => Query::Update {
                where_clause: self.scope_where(model, where_clause, "where")?,
                data: self.update_record(model, data, "data")?,
            },
            Query::UpdateMany { where_clause, data } => Query::UpdateMany {
                where_clause: self.scope_where(model, where_clause, "where")?,
                data: self.update_record(model, data, "data")?,
            },
            Query::Delete { where_clause } => Query::Delete {
                where_clause: self.scope_where(model, where_clause, "where")?,
            },
            Query::DeleteMany { where_clause } => Query::DeleteMany {
                where_clause: self.scope_where(model, where_clause, "where")?,
            },
            Query::Upsert { where_clause, create, update } => Query::Upsert {
                where_clause: self.scope_where(model, where_clause, "where")?,
                create: self.create_record(model, create, "create")?,
                update: self.update_record(model, update, "update")?,
            },
        };

        Ok(ScopePlan {
            query,
            checks: self.checks,
        })
    }

    fn organization(&self) -> Result<&'a str, TenantError> {
        self.organization_id.ok_or(TenantError::ContextMissing)
    }

    fn disallowed(&self, model: &str, reason: impl Into<String>) -> TenantError {
        TenantError::disallowed(model, self.operation, reason)
    }

    fn check_writable(&self, model: &str) -> Result<(), TenantError> {
        match self.registry.write_access(model) {
            WriteAccess::None => Err(self.disallowed(model, format!("{} cannot be written through a query client", model))),
            WriteAccess::Open | WriteAccess::Internal => Ok(()),
        }
    }

    fn scope_filter(&mut self, model: &str, mut filter: FilterData) -> Result<FilterData, TenantError> {
        if self.registry.is_tenant_owned(model) {
            let where_clause = filter.where_clause.take().unwrap_or(Value::Null);
            filter.where_clause = Some(self.scope_where(model, where_clause, "where")?);
        }
        Ok(filter)
    }

    /// Validate organization claims, then pin the predicate to the bound organization
    fn scope_where(&mut self, model: &str, where_clause: Value, location: &str) -> Result<Value, TenantError> {
        if !self.registry.is_tenant_owned(model) {
            return Ok(where_clause);
        }
        let org = self.organization()?;

        let mut conditions = match where_clause {
            Value::Null => Map::new(),
            Value::Object(conditions) => conditions,
            Value::String(_) => return Err(self.disallowed(model, "raw SQL filters are not allowed on tenant-owned models")),
            _ => return Err(self.disallowed(model, format!("{} must be an object", location))),
        };

        self.check_claims(model, &conditions, org, location, false)?;
        conditions.insert(ORG_COLUMN.to_string(), Value::String(org.to_string()));
        Ok(Value::Object(conditions))
    }

    fn check_claims(
        &self,
        model: &str,
        conditions: &Map<String, Value>,
        org: &str,
        location: &str,
        negated: bool,
    ) -> Result<(), TenantError> {
        for (key, value) in conditions {
            match key.as_str() {
                ORG_COLUMN => {
                    if negated || !claims_only(value, org) {
                        return Err(TenantError::mismatch(model, format!("{}.{}", location, ORG_COLUMN)));
                    }
                }
                "$and" | "$or" => {
                    let Some(branches) = value.as_array() else {
                        return Err(self.disallowed(model, format!("{}.{} must be an array", location, key)));
                    };
                    for branch in branches {
                        self.check_branch(model, branch, org, location, negated)?;
                    }
                }
                "$not" => self.check_branch(model, value, org, location, true)?,
                other if other.starts_with('$') => {
                    return Err(self.disallowed(model, format!("unsupported operator '{}' at {}", other, location)))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_branch(&self, model: &str, branch: &Value, org: &str, location: &str, negated: bool) -> Result<(), TenantError> {
        match branch {
            Value::Object(conditions) => self.check_claims(model, conditions, org, location, negated),
            Value::String(_) => Err(self.disallowed(model, "raw SQL filters are not allowed on tenant-owned models")),
            _ => Ok(()),
        }
    }

    fn check_unique(&self, model: &str, key: &UniqueWhere) -> Result<(), TenantError> {
        let org = self.organization()?;
        let fields = match key {
            UniqueWhere::Field { field, .. } => {
                return Err(self.disallowed(
                    model,
                    format!("unique lookup by '{}' alone is not scoped; use a compound key with {}", field, ORG_COLUMN),
                ))
            }
            UniqueWhere::Compound(fields) => fields,
        };

        // Key fields are plain columns compared by equality, never operators
        if let Some(operator) = fields.keys().find(|k| k.starts_with('$')) {
            return Err(self.disallowed(model, format!("compound key cannot contain operator '{}'", operator)));
        }

        match fields.get(ORG_COLUMN) {
            None => return Err(self.disallowed(model, format!("compound key must include {}", ORG_COLUMN))),
            Some(Value::String(claimed)) if claimed == org => {}
            Some(_) => return Err(TenantError::mismatch(model, format!("where.{}", ORG_COLUMN))),
        }
        if fields.len() < 2 {
            return Err(self.disallowed(model, format!("compound key needs a field besides {}", ORG_COLUMN)));
        }
        if fields.values().any(|v| v.is_object() || v.is_array()) {
            return Err(self.disallowed(model, "compound key values must be scalars"));
        }
        Ok(())
    }

    fn create_record(&mut self, model: &str, mut record: Record, location: &str) -> Result<Record, TenantError> {
        if self.registry.is_tenant_owned(model) {
            let org = self.organization()?;
            match record.get(ORG_COLUMN) {
                None => {}
                Some(Value::String(claimed)) if claimed == org => {}
                Some(_) => return Err(TenantError::mismatch(model, format!("{}.{}", location, ORG_COLUMN))),
            }
            record.insert(ORG_COLUMN.to_string(), Value::String(org.to_string()));
        }
        self.walk_relations(model, &mut record, location)?;
        Ok(record)
    }

    fn update_record(&mut self, model: &str, mut record: Record, location: &str) -> Result<Record, TenantError> {
        if self.registry.is_tenant_owned(model) {
            let org = self.organization()?;
            match record.get(ORG_COLUMN) {
                None => {}
                Some(Value::String(claimed)) if claimed == org => {}
                Some(_) => return Err(TenantError::mismatch(model, format!("{}.{}", location, ORG_COLUMN))),
            }
        }
        self.walk_relations(model, &mut record, location)?;
        Ok(record)
    }

    fn walk_relations(&mut self, model: &str, record: &mut Record, location: &str) -> Result<(), TenantError> {
        let registry = self.registry;
        let Some(def) = registry.model(model) else {
            return Ok(());
        };

        for relation in &def.relations {
            if let Some(instructions) = record.remove(&relation.name) {
                let path = format!("{}.{}", location, relation.name);
                let rewritten = self.relation_write(model, relation, instructions, &path)?;
                record.insert(relation.name.clone(), rewritten);
            }

            if relation.kind == RelationKind::BelongsTo && registry.is_tenant_owned(&relation.target) {
                if let Some(reference) = record.get(&relation.foreign_key).filter(|v| !v.is_null()).cloned() {
                    let path = format!("{}.{}", location, relation.foreign_key);
                    let mut by_id = Map::new();
                    by_id.insert("id".to_string(), reference);
                    self.verify_reference(&relation.target, Value::Object(by_id), &path, false)?;
                }
            }
        }
        Ok(())
    }

    fn relation_write(
        &mut self,
        model: &str,
        relation: &Relation,
        instructions: Value,
        location: &str,
    ) -> Result<Value, TenantError> {
        let Value::Object(instructions) = instructions else {
            return Err(self.disallowed(model, format!("{} must be an object of nested write instructions", location)));
        };
        let target = relation.target.as_str();
        let to_many = relation.kind == RelationKind::HasMany;
        self.check_writable(target)?;

        let mut rewritten = Map::new();
        for (instruction, arg) in instructions {
            let path = format!("{}.{}", location, instruction);
            if !to_many && matches!(instruction.as_str(), "createMany" | "updateMany" | "deleteMany" | "set") {
                return Err(self.disallowed(model, format!("{} is only valid on to-many relations", path)));
            }

            let arg = match instruction.as_str() {
                "create" => self.each(arg, to_many, &path, |s, item, at| s.nested_create(target, item, at))?,
                "createMany" => self.nested_create_many(target, arg, &path)?,
                "update" | "updateMany" => {
                    self.each(arg, to_many, &path, |s, item, at| s.nested_update(target, item, at, to_many))?
                }
                "upsert" => self.each(arg, to_many, &path, |s, item, at| s.nested_upsert(target, item, at, to_many))?,
                "connect" | "set" => self.each(arg, to_many, &path, |s, item, at| {
                    s.verify_reference(target, item, at, true)
                })?,
                "connectOrCreate" => {
                    self.each(arg, to_many, &path, |s, item, at| s.nested_connect_or_create(target, item, at))?
                }
                "delete" | "disconnect" => arg,
                "deleteMany" => self.each(arg, true, &path, |s, item, at| s.scope_where(target, item, at))?,
                other => {
                    return Err(self.disallowed(model, format!("unknown nested instruction '{}' at {}", other, location)))
                }
            };
            rewritten.insert(instruction, arg);
        }
        Ok(Value::Object(rewritten))
    }

    /// Apply `f` to every element of an array argument, or to the single argument
    fn each<F>(&mut self, arg: Value, to_many: bool, location: &str, mut f: F) -> Result<Value, TenantError>
    where
        F: FnMut(&mut Self, Value, &str) -> Result<Value, TenantError>,
    {
        match arg {
            Value::Array(items) if to_many => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| f(self, item, &format!("{}[{}]", location, i)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            item => f(self, item, location),
        }
    }

    fn as_record(&self, model: &str, value: Value, location: &str) -> Result<Record, TenantError> {
        match value {
            Value::Object(record) => Ok(record),
            _ => Err(self.disallowed(model, format!("{} must be an object", location))),
        }
    }

    fn nested_create(&mut self, target: &str, item: Value, location: &str) -> Result<Value, TenantError> {
        let record = self.as_record(target, item, location)?;
        Ok(Value::Object(self.create_record(target, record, location)?))
    }

    fn nested_create_many(&mut self, target: &str, arg: Value, location: &str) -> Result<Value, TenantError> {
        let mut body = self.as_record(target, arg, location)?;
        let data = body.remove("data").unwrap_or(Value::Array(vec![]));
        let data_path = format!("{}.data", location);
        let data = self.each(data, true, &data_path, |s, item, at| s.nested_create(target, item, at))?;
        body.insert("data".to_string(), data);
        Ok(Value::Object(body))
    }

    fn nested_update(&mut self, target: &str, item: Value, location: &str, to_many: bool) -> Result<Value, TenantError> {
        let mut body = self.as_record(target, item, location)?;
        if !to_many && !body.contains_key("data") {
            return Ok(Value::Object(self.update_record(target, body, location)?));
        }

        let where_clause = body.remove("where").unwrap_or(Value::Null);
        let data = match body.remove("data") {
            Some(data) => self.as_record(target, data, location)?,
            None => return Err(self.disallowed(target, format!("{} requires data", location))),
        };
        body.insert("where".to_string(), self.scope_where(target, where_clause, location)?);
        body.insert("data".to_string(), Value::Object(self.update_record(target, data, location)?));
        Ok(Value::Object(body))
    }

    fn nested_upsert(&mut self, target: &str, item: Value, location: &str, to_many: bool) -> Result<Value, TenantError> {
        let mut body = self.as_record(target, item, location)?;
        let (Some(create), Some(update)) = (body.remove("create"), body.remove("update")) else {
            return Err(self.disallowed(target, format!("{} requires create and update", location)));
        };
        if to_many || body.contains_key("where") {
            let where_clause = body.remove("where").unwrap_or(Value::Null);
            body.insert("where".to_string(), self.scope_where(target, where_clause, location)?);
        }
        let create = self.as_record(target, create, location)?;
        let update = self.as_record(target, update, location)?;
        body.insert("create".to_string(), Value::Object(self.create_record(target, create, location)?));
        body.insert("update".to_string(), Value::Object(self.update_record(target, update, location)?));
        Ok(Value::Object(body))
    }

    fn nested_connect_or_create(&mut self, target: &str, item: Value, location: &str) -> Result<Value, TenantError> {
        let mut body = self.as_record(target, item, location)?;
        let (Some(where_clause), Some(create)) = (body.remove("where"), body.remove("create")) else {
            return Err(self.disallowed(target, format!("{} requires where and create", location)));
        };
        // Scoped `where` only ever matches rows of the bound organization; a row owned
        // elsewhere is indistinguishable from a missing one and falls through to `create`
        let where_path = format!("{}.where", location);
        self.require_verification(target, &where_path)?;
        if !matches!(&where_clause, Value::Object(conditions) if !conditions.is_empty()) {
            return Err(self.disallowed(target, format!("{} must be a non-empty object", where_path)));
        }
        let where_clause = self.scope_where(target, where_clause, &where_path)?;
        let create = self.as_record(target, create, location)?;
        let create = self.create_record(target, create, &format!("{}.create", location))?;
        body.insert("where".to_string(), where_clause);
        body.insert("create".to_string(), Value::Object(create));
        Ok(Value::Object(body))
    }

    /// Queue a lookup for a referenced row in a tenant-owned model and return the
    /// predicate the client should use to find it
    fn verify_reference(
        &mut self,
        target: &str,
        where_clause: Value,
        location: &str,
        instruction: bool,
    ) -> Result<Value, TenantError> {
        if !self.registry.is_tenant_owned(target) {
            return Ok(where_clause);
        }
        if !self.verify_references {
            if instruction {
                self.require_verification(target, location)?;
            }
            warn!(model = target, location, "Unverified foreign key into tenant-owned model");
            return Ok(where_clause);
        }
        match &where_clause {
            Value::Object(conditions) if !conditions.is_empty() => {}
            _ => return Err(self.disallowed(target, format!("{} must be a non-empty object", location))),
        }

        let scoped = self.scope_where(target, where_clause, location)?;
        self.checks.push(ReferenceCheck {
            model: target.to_string(),
            scoped: scoped.clone(),
            location: location.to_string(),
        });
        Ok(scoped)
    }

    /// Attach instructions into tenant-owned models are refused outright when
    /// reference verification is switched off
    fn require_verification(&self, target: &str, location: &str) -> Result<(), TenantError> {
        if self.registry.is_tenant_owned(target) && !self.verify_references {
            return Err(self.disallowed(
                target,
                format!("{} attaches a tenant-owned row and reference verification is disabled", location),
            ));
        }
        Ok(())
    }
}

/// True when every way `value` names an organization names exactly `org`
fn claims_only(value: &Value, org: &str) -> bool {
    match value {
        Value::String(claimed) => claimed == org,
        Value::Object(ops) => {
            !ops.is_empty()
                && ops.iter().all(|(op, arg)| match op.as_str() {
                    "$eq" => arg.as_str() == Some(org),
                    "$in" => arg
                        .as_array()
                        .map(|items| !items.is_empty() && items.iter().all(|v| v.as_str() == Some(org)))
                        .unwrap_or(false),
                    _ => false,
                })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(query: Query) -> Result<ScopePlan, TenantError> {
        plan_on("clusters", query)
    }

    fn plan_on(model: &str, query: Query) -> Result<ScopePlan, TenantError> {
        let registry = ModelRegistry::standard();
        Scoper::new(&registry, Some("acme"), true).plan(model, query)
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn find_many_merges_organization() {
        let planned = plan(Query::find_many(json!({"status": "active"}))).unwrap();
        assert_eq!(
            planned.query,
            Query::find_many(json!({"status": "active", "organization_id": "acme"}))
        );
    }

    #[test]
    fn missing_where_is_scoped() {
        let planned = plan(Query::Count(FilterData::default())).unwrap();
        assert_eq!(planned.query, Query::count(json!({"organization_id": "acme"})));
    }

    #[test]
    fn matching_claims_are_accepted() {
        for claim in [json!("acme"), json!({"$eq": "acme"}), json!({"$in": ["acme"]})] {
            let planned = plan(Query::find_many(json!({"organization_id": claim}))).unwrap();
            assert_eq!(planned.query, Query::find_many(json!({"organization_id": "acme"})));
        }
    }

    #[test]
    fn foreign_claims_are_rejected() {
        for filter in [
            json!({"organization_id": "other-org"}),
            json!({"organization_id": {"$in": ["acme", "other-org"]}}),
            json!({"organization_id": {"$ne": "acme"}}),
            json!({"organization_id": {"$like": "%"}}),
            json!({"$or": [{"organization_id": "other-org"}, {"name": "x"}]}),
            json!({"$not": {"organization_id": "acme"}}),
        ] {
            let err = plan(Query::find_many(filter.clone())).unwrap_err();
            assert!(matches!(err, TenantError::TenantMismatch { .. }), "{}", filter);
        }
    }

    #[test]
    fn raw_sql_is_disallowed() {
        let err = plan(Query::find_many(json!("1=1"))).unwrap_err();
        assert!(matches!(err, TenantError::DisallowedOperation { .. }));
        let err = plan(Query::find_many(json!({"$and": ["1=1) OR (1=1"]}))).unwrap_err();
        assert!(matches!(err, TenantError::DisallowedOperation { .. }));
    }

    #[test]
    fn unique_requires_compound_key_with_organization() {
        let err = plan(Query::FindUnique(UniqueWhere::field("id", "c1"))).unwrap_err();
        assert!(matches!(err, TenantError::DisallowedOperation { .. }));

        let err = plan(Query::FindUnique(UniqueWhere::compound([("id", "c1"), ("name", "x")]))).unwrap_err();
        assert!(matches!(err, TenantError::DisallowedOperation { .. }));

        let err = plan(Query::FindUnique(UniqueWhere::compound([("id", "c1"), ("organization_id", "other-org")])))
            .unwrap_err();
        assert!(matches!(err, TenantError::TenantMismatch { .. }));

        assert!(plan(Query::FindUnique(UniqueWhere::compound([("id", "c1"), ("organization_id", "acme")]))).is_ok());
    }

    #[test]
    fn compound_key_operators_are_disallowed() {
        for (operator, value) in [
            ("$not", json!("EXISTS (SELECT 1 FROM clusters WHERE organization_id = 'other-org')")),
            ("$or", json!([{"id": "c2"}])),
            ("$and", json!("1=1")),
        ] {
            let key = UniqueWhere::compound([("id", json!("c1")), ("organization_id", json!("acme")), (operator, value)]);
            let err = plan(Query::FindUnique(key)).unwrap_err();
            assert!(matches!(err, TenantError::DisallowedOperation { .. }), "{} gave {:?}", operator, err);
        }
    }

    #[test]
    fn malformed_logical_operators_are_disallowed() {
        for filter in [
            json!({"id": "c1", "$or": "1=1"}),
            json!({"$and": {"id": "c1"}}),
            json!({"$raw": "1=1"}),
            json!({"$not": {"$not": "1=1"}}),
        ] {
            let err = plan(Query::update(filter.clone(), json!({"name": "x"})).unwrap()).unwrap_err();
            assert!(matches!(err, TenantError::DisallowedOperation { .. }), "{} gave {:?}", filter, err);
        }
    }

    #[test]
    fn create_stamps_and_rejects_conflicts() {
        let planned = plan(Query::create(json!({"name": "prod"})).unwrap()).unwrap();
        assert_eq!(planned.query, Query::create(json!({"name": "prod", "organization_id": "acme"})).unwrap());

        let err = plan(Query::create(json!({"name": "prod", "organization_id": "other-org"})).unwrap()).unwrap_err();
        assert!(matches!(err, TenantError::TenantMismatch { .. }));

        let err = plan(Query::create(json!({"name": "prod", "organization_id": null})).unwrap()).unwrap_err();
        assert!(matches!(err, TenantError::TenantMismatch { .. }));
    }

    #[test]
    fn create_many_fails_on_one_bad_element() {
        let err = plan(Query::CreateMany(vec![
            record(json!({"name": "a"})),
            record(json!({"name": "b", "organization_id": "other-org"})),
        ]))
        .unwrap_err();
        assert!(matches!(err, TenantError::TenantMismatch { location, .. } if location == "data[1].organization_id"));
    }

    #[test]
    fn update_scopes_where_and_checks_data() {
        let planned = plan(Query::update(json!({"id": "c1"}), json!({"name": "renamed"})).unwrap()).unwrap();
        assert_eq!(
            planned.query,
            Query::update(json!({"id": "c1", "organization_id": "acme"}), json!({"name": "renamed"})).unwrap()
        );

        let err = plan(Query::update(json!({"id": "c1"}), json!({"organization_id": "other-org"})).unwrap()).unwrap_err();
        assert!(matches!(err, TenantError::TenantMismatch { .. }));
    }

    #[test]
    fn upsert_applies_both_rules() {
        let err = plan(Query::Upsert {
            where_clause: json!({"id": "c1"}),
            create: record(json!({"name": "a"})),
            update: record(json!({"organization_id": "other-org"})),
        })
        .unwrap_err();
        assert!(matches!(err, TenantError::TenantMismatch { .. }));

        let planned = plan(Query::Upsert {
            where_clause: json!({"id": "c1"}),
            create: record(json!({"name": "a"})),
            update: record(json!({"name": "b"})),
        })
        .unwrap();
        let Query::Upsert { where_clause, create, .. } = planned.query else { panic!("expected upsert") };
        assert_eq!(where_clause, json!({"id": "c1", "organization_id": "acme"}));
        assert_eq!(create.get("organization_id"), Some(&json!("acme")));
    }

    #[test]
    fn nested_create_is_stamped_recursively() {
        let planned = plan(Query::create(json!({
            "name": "prod",
            "deployments": {"create": [{"name": "api"}, {"name": "web"}]}
        })).unwrap())
        .unwrap();
        let Query::Create(created) = planned.query else { panic!("expected create") };
        assert_eq!(
            created["deployments"]["create"],
            json!([
                {"name": "api", "organization_id": "acme"},
                {"name": "web", "organization_id": "acme"}
            ])
        );

        let err = plan(Query::create(json!({
            "name": "prod",
            "deployments": {"create": {"name": "api", "organization_id": "other-org"}}
        })).unwrap())
        .unwrap_err();
        assert!(matches!(err, TenantError::TenantMismatch { .. }));
    }

    #[test]
    fn connect_queues_scoped_check() {
        let planned = plan_on(
            "deployments",
            Query::create(json!({"name": "api", "cluster": {"connect": {"id": "c1"}}})).unwrap(),
        )
        .unwrap();
        assert_eq!(planned.checks.len(), 1);
        let check = &planned.checks[0];
        assert_eq!(check.model, "clusters");
        assert_eq!(check.scoped, json!({"id": "c1", "organization_id": "acme"}));
    }

    #[test]
    fn foreign_key_columns_are_checked() {
        let planned = plan_on("deployments", Query::create(json!({"name": "api", "cluster_id": "c9"})).unwrap()).unwrap();
        assert_eq!(planned.checks[0].scoped, json!({"id": "c9", "organization_id": "acme"}));
    }

    #[test]
    fn connect_without_verification_is_refused() {
        let registry = ModelRegistry::standard();
        let err = Scoper::new(&registry, Some("acme"), false)
            .plan("deployments", Query::create(json!({"cluster": {"connect": {"id": "c1"}}})).unwrap())
            .unwrap_err();
        assert!(matches!(err, TenantError::DisallowedOperation { .. }));

        // Plain foreign keys only warn
        let planned = Scoper::new(&registry, Some("acme"), false)
            .plan("deployments", Query::create(json!({"cluster_id": "c1"})).unwrap())
            .unwrap();
        assert!(planned.checks.is_empty());
    }

    #[test]
    fn connect_or_create_scopes_where_and_stamps_create() {
        let query = Query::create(json!({
            "name": "prod",
            "deployments": {"connectOrCreate": {"where": {"id": "d1"}, "create": {"name": "api"}}}
        }))
        .unwrap();
        let planned = plan(query.clone()).unwrap();
        assert!(planned.checks.is_empty());
        let Query::Create(created) = planned.query else { panic!("expected create") };
        assert_eq!(
            created["deployments"]["connectOrCreate"],
            json!({"where": {"id": "d1", "organization_id": "acme"}, "create": {"name": "api", "organization_id": "acme"}})
        );

        let registry = ModelRegistry::standard();
        let err = Scoper::new(&registry, Some("acme"), false).plan("clusters", query).unwrap_err();
        assert!(matches!(err, TenantError::DisallowedOperation { .. }));
    }

    #[test]
    fn unknown_nested_instruction_is_disallowed() {
        let err = plan(Query::create(json!({"deployments": {"merge": {"id": "d1"}}})).unwrap()).unwrap_err();
        assert!(matches!(err, TenantError::DisallowedOperation { .. }));
        let err = plan_on("deployments", Query::create(json!({"cluster": {"set": [{"id": "c1"}]}})).unwrap()).unwrap_err();
        assert!(matches!(err, TenantError::DisallowedOperation { .. }));
    }

    #[test]
    fn shared_models_pass_through_without_context() {
        let registry = ModelRegistry::standard();
        let query = Query::find_many(json!({"email": "a@example.com"}));
        let planned = Scoper::new(&registry, None, true).plan("users", query.clone()).unwrap();
        assert_eq!(planned.query, query);
    }

    #[test]
    fn shared_model_nesting_into_tenant_model_is_scoped() {
        let registry = ModelRegistry::new()
            .shared_model("users")
            .tenant_model("notes")
            .has_many("users", "notes", "notes", "user_id");
        let query = Query::create(json!({"email": "a@example.com", "notes": {"create": {"body": "hi"}}})).unwrap();
        let err = Scoper::new(&registry, None, true).plan("users", query.clone()).unwrap_err();
        assert!(matches!(err, TenantError::ContextMissing));

        let planned = Scoper::new(&registry, Some("acme"), true).plan("users", query).unwrap();
        let Query::Create(created) = planned.query else { panic!("expected create") };
        assert_eq!(created["notes"]["create"]["organization_id"], json!("acme"));
    }

    #[test]
    fn sink_models_refuse_query_writes() {
        let writes = [
            ("audit_logs", Query::create(json!({"action": "create", "user_id": "u-admin"})).unwrap()),
            ("audit_logs", Query::update(json!({"id": "a1"}), json!({"user_id": "u-admin"})).unwrap()),
            ("audit_logs", Query::DeleteMany { where_clause: Value::Null }),
            (
                "users",
                Query::create(json!({"email": "a@example.com", "audit_logs": {"create": {"action": "signup"}}})).unwrap(),
            ),
        ];
        for (model, query) in writes {
            let err = plan_on(model, query).unwrap_err();
            assert!(matches!(err, TenantError::DisallowedOperation { .. }), "{} gave {:?}", model, err);
        }

        assert!(plan_on("audit_logs", Query::find_many(json!({"action": "create"}))).is_ok());
        assert!(plan_on("bulk_operations", Query::create(json!({"action": "bulk_sync"})).unwrap()).is_ok());
    }

    #[test]
    fn every_operation_fails_closed_without_context() {
        let registry = ModelRegistry::standard();
        let queries = vec![
            Query::find_many(json!({})),
            Query::FindFirst(FilterData::default()),
            Query::FindUnique(UniqueWhere::compound([("id", "c1"), ("organization_id", "acme")])),
            Query::count(json!({})),
            Query::create(json!({"name": "x"})).unwrap(),
            Query::CreateMany(vec![]),
            Query::update(json!({"id": "c1"}), json!({"name": "y"})).unwrap(),
            Query::DeleteMany { where_clause: Value::Null },
        ];
        for query in queries {
            let err = Scoper::new(&registry, None, true).plan("clusters", query).unwrap_err();
            assert!(matches!(err, TenantError::ContextMissing));
        }
    }
}
