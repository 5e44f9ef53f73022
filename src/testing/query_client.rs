use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::lock;
use crate::database::manager::DatabaseError;
use crate::filter::filter_order::FilterOrder;
use crate::filter::{FilterData, FilterOp, SortDirection};
use crate::interceptor::{count_result, AggregateFunction, ModelRegistry, Query, QueryClient, Record, Relation, RelationKind};
use crate::tenant::TenantError;

type Tables = HashMap<String, Vec<Record>>;

/// In-memory `QueryClient` with the same result shapes as `PgQueryClient`.
///
/// Every call runs against a copy of the tables that is committed only on success,
/// so a failed nested write leaves nothing behind.
pub struct MemoryQueryClient {
    registry: ModelRegistry,
    tables: Mutex<Tables>,
    executed: Mutex<Vec<(String, Query)>>,
    calls: AtomicUsize,
    pending_failures: AtomicUsize,
    latency: Option<Duration>,
}

impl Default for MemoryQueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueryClient {
    pub fn new() -> Self {
        Self::with_registry(ModelRegistry::standard())
    }

    pub fn with_registry(registry: ModelRegistry) -> Self {
        Self {
            registry,
            tables: Mutex::new(HashMap::new()),
            executed: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
            pending_failures: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Sleep before every call, giving concurrent callers a suspension point
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The next `count` calls fail with a transient pool timeout
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, AtomicOrdering::SeqCst);
    }

    /// Seed a row directly, bypassing any interceptor
    pub fn insert_row(&self, model: &str, row: Value) {
        if let Value::Object(record) = row {
            lock(&self.tables).entry(model.to_string()).or_default().push(record);
        }
    }

    pub fn rows(&self, model: &str) -> Vec<Value> {
        lock(&self.tables)
            .get(model)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    /// Every query that reached the data layer, after any rewriting
    pub fn executed(&self) -> Vec<(String, Query)> {
        lock(&self.executed).clone()
    }

    pub fn last_query(&self, model: &str) -> Option<Query> {
        lock(&self.executed)
            .iter()
            .rev()
            .find(|(m, _)| m == model)
            .map(|(_, q)| q.clone())
    }
}

#[async_trait]
impl QueryClient for MemoryQueryClient {
    async fn query(&self, model: &str, query: Query) -> Result<Value, TenantError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .pending_failures
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TenantError::Database(DatabaseError::Sqlx(sqlx::Error::PoolTimedOut)));
        }

        lock(&self.executed).push((model.to_string(), query.clone()));

        let mut tables = lock(&self.tables);
        let mut working = tables.clone();
        let result = Executor {
            registry: &self.registry,
            tables: &mut working,
        }
        .run(model, query)?;
        *tables = working;
        Ok(result)
    }
}

struct Executor<'a> {
    registry: &'a ModelRegistry,
    tables: &'a mut Tables,
}

impl<'a> Executor<'a> {
    fn run(&mut self, model: &str, query: Query) -> Result<Value, TenantError> {
        match query {
            Query::FindMany(filter) => Ok(Value::Array(self.select(model, &filter)?.into_iter().map(Value::Object).collect())),
            Query::FindFirst(filter) => Ok(self
                .select(model, &filter)?
                .into_iter()
                .next()
                .map(Value::Object)
                .unwrap_or(Value::Null)),
            Query::FindUnique(key) => Ok(self
                .find(model, &key.to_where())?
                .map(|i| Value::Object(self.table(model)[i].clone()))
                .unwrap_or(Value::Null)),
            Query::Count(filter) => {
                let where_clause = filter.where_clause.unwrap_or(Value::Null);
                Ok(Value::from(self.matching(model, &where_clause)?.len() as u64))
            }
            Query::Aggregate { filter, function, field } => self.aggregate(model, &filter, function, field.as_deref()),
            Query::GroupBy { filter, by } => self.group_by(model, &filter, &by),
            Query::Create(record) => self.create(model, record).map(Value::Object),
            Query::CreateMany(records) => {
                let count = records.len() as u64;
                for record in records {
                    self.create(model, record)?;
                }
                Ok(count_result(count))
            }
            Query::Update { where_clause, data } => match self.find(model, &where_clause)? {
                Some(index) => self.update_at(model, index, data).map(Value::Object),
                None => Ok(Value::Null),
            },
            Query::UpdateMany { where_clause, data } => {
                let indexes = self.matching(model, &where_clause)?;
                for &index in &indexes {
                    self.update_at(model, index, data.clone())?;
                }
                Ok(count_result(indexes.len() as u64))
            }
            Query::Delete { where_clause } => match self.find(model, &where_clause)? {
                Some(index) => Ok(Value::Object(self.table(model).remove(index))),
                None => Ok(Value::Null),
            },
            Query::DeleteMany { where_clause } => {
                let indexes = self.matching(model, &where_clause)?;
                let table = self.table(model);
                for &index in indexes.iter().rev() {
                    table.remove(index);
                }
                Ok(count_result(indexes.len() as u64))
            }
            Query::Upsert { where_clause, create, update } => match self.find(model, &where_clause)? {
                Some(index) => self.update_at(model, index, update).map(Value::Object),
                None => self.create(model, create).map(Value::Object),
            },
        }
    }

    fn table(&mut self, model: &str) -> &mut Vec<Record> {
        self.tables.entry(model.to_string()).or_default()
    }

    fn relations(&self, model: &str) -> Vec<Relation> {
        self.registry.model(model).map(|m| m.relations.clone()).unwrap_or_default()
    }

    fn matching(&mut self, model: &str, where_clause: &Value) -> Result<Vec<usize>, TenantError> {
        let mut indexes = vec![];
        for (i, row) in self.table(model).iter().enumerate() {
            if matches(row, where_clause)? {
                indexes.push(i);
            }
        }
        Ok(indexes)
    }

    fn find(&mut self, model: &str, where_clause: &Value) -> Result<Option<usize>, TenantError> {
        Ok(self.matching(model, where_clause)?.into_iter().next())
    }

    fn select(&mut self, model: &str, filter: &FilterData) -> Result<Vec<Record>, TenantError> {
        let where_clause = filter.where_clause.clone().unwrap_or(Value::Null);
        let table = self.table(model).clone();
        let mut rows = vec![];
        for row in table {
            if matches(&row, &where_clause)? {
                rows.push(row);
            }
        }

        if let Some(order) = &filter.order {
            let order = FilterOrder::validate_and_parse(order)?;
            rows.sort_by(|a, b| {
                for info in &order {
                    let ordering = compare(a.get(&info.column), b.get(&info.column));
                    let ordering = match info.sort {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        let rows = rows.into_iter().skip(offset).take(limit);

        Ok(match &filter.select {
            Some(columns) if !columns.iter().any(|c| c == "*") => rows
                .map(|row| {
                    columns
                        .iter()
                        .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                        .collect()
                })
                .collect(),
            _ => rows.collect(),
        })
    }

    fn aggregate(
        &mut self,
        model: &str,
        filter: &FilterData,
        function: AggregateFunction,
        field: Option<&str>,
    ) -> Result<Value, TenantError> {
        let rows = self.select(model, filter)?;
        let values: Vec<Value> = match field {
            Some(field) => rows.iter().filter_map(|r| r.get(field)).filter(|v| !v.is_null()).cloned().collect(),
            None => rows.into_iter().map(Value::Object).collect(),
        };
        let numbers = || values.iter().filter_map(Value::as_f64);

        Ok(match function {
            AggregateFunction::Count => Value::from(values.len() as u64),
            AggregateFunction::Sum if values.is_empty() => Value::Null,
            AggregateFunction::Sum => Value::from(numbers().sum::<f64>()),
            AggregateFunction::Avg if values.is_empty() => Value::Null,
            AggregateFunction::Avg => Value::from(numbers().sum::<f64>() / values.len() as f64),
            AggregateFunction::Min => values
                .iter()
                .min_by(|a, b| compare(Some(a), Some(b)))
                .cloned()
                .unwrap_or(Value::Null),
            AggregateFunction::Max => values
                .iter()
                .max_by(|a, b| compare(Some(a), Some(b)))
                .cloned()
                .unwrap_or(Value::Null),
        })
    }

    fn group_by(&mut self, model: &str, filter: &FilterData, by: &[String]) -> Result<Value, TenantError> {
        let rows = self.select(model, filter)?;
        let mut groups: BTreeMap<String, (Record, u64)> = BTreeMap::new();
        for row in rows {
            let mut key = Map::new();
            for column in by {
                key.insert(column.clone(), row.get(column).cloned().unwrap_or(Value::Null));
            }
            let entry = groups.entry(Value::Object(key.clone()).to_string()).or_insert((key, 0));
            entry.1 += 1;
        }
        Ok(Value::Array(
            groups
                .into_values()
                .map(|(mut key, count)| {
                    key.insert("_count".to_string(), Value::from(count));
                    Value::Object(key)
                })
                .collect(),
        ))
    }

    fn create(&mut self, model: &str, mut record: Record) -> Result<Record, TenantError> {
        let mut children = vec![];
        for relation in self.relations(model) {
            let Some(instructions) = record.remove(&relation.name) else { continue };
            match relation.kind {
                RelationKind::BelongsTo => {
                    let id = self.resolve_parent(&relation, instructions)?;
                    record.insert(relation.foreign_key.clone(), id);
                }
                RelationKind::HasMany => children.push((relation, instructions)),
            }
        }

        let id = record
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
            .clone();
        self.table(model).push(record.clone());

        for (relation, instructions) in children {
            self.write_children(&relation, &id, instructions)?;
        }
        Ok(record)
    }

    fn update_at(&mut self, model: &str, index: usize, mut data: Record) -> Result<Record, TenantError> {
        let mut children = vec![];
        for relation in self.relations(model) {
            let Some(instructions) = data.remove(&relation.name) else { continue };
            match relation.kind {
                RelationKind::BelongsTo => {
                    let id = self.resolve_parent(&relation, instructions)?;
                    data.insert(relation.foreign_key.clone(), id);
                }
                RelationKind::HasMany => children.push((relation, instructions)),
            }
        }

        let row = &mut self.table(model)[index];
        for (key, value) in data {
            row.insert(key, value);
        }
        let row = row.clone();
        let id = row.get("id").cloned().unwrap_or(Value::Null);

        for (relation, instructions) in children {
            self.write_children(&relation, &id, instructions)?;
        }
        Ok(row)
    }

    /// Resolve a to-one nested write to the id the foreign key should hold
    fn resolve_parent(&mut self, relation: &Relation, instructions: Value) -> Result<Value, TenantError> {
        let target = relation.target.as_str();
        let mut id = Value::Null;
        for (instruction, arg) in into_record(instructions)? {
            id = match instruction.as_str() {
                "create" => self.create(target, into_record(arg)?)?.get("id").cloned().unwrap_or(Value::Null),
                "connect" => self.existing_id(target, &arg)?,
                "connectOrCreate" => {
                    let mut body = into_record(arg)?;
                    let where_clause = body.remove("where").unwrap_or(Value::Null);
                    match self.find(target, &where_clause)? {
                        Some(index) => self.table(target)[index].get("id").cloned().unwrap_or(Value::Null),
                        None => {
                            let create = into_record(body.remove("create").unwrap_or(Value::Null))?;
                            self.create(target, create)?.get("id").cloned().unwrap_or(Value::Null)
                        }
                    }
                }
                other => return Err(unsupported(other)),
            };
        }
        Ok(id)
    }

    fn write_children(&mut self, relation: &Relation, parent_id: &Value, instructions: Value) -> Result<(), TenantError> {
        let target = relation.target.as_str();
        let fk = relation.foreign_key.as_str();
        for (instruction, arg) in into_record(instructions)? {
            match instruction.as_str() {
                "create" => {
                    for item in items(arg) {
                        let mut record = into_record(item)?;
                        record.insert(fk.to_string(), parent_id.clone());
                        self.create(target, record)?;
                    }
                }
                "createMany" => {
                    let mut body = into_record(arg)?;
                    for item in items(body.remove("data").unwrap_or(Value::Null)) {
                        let mut record = into_record(item)?;
                        record.insert(fk.to_string(), parent_id.clone());
                        self.create(target, record)?;
                    }
                }
                "connect" | "set" => {
                    if instruction == "set" {
                        for row in self.table(target).iter_mut().filter(|r| r.get(fk) == Some(parent_id)) {
                            row.insert(fk.to_string(), Value::Null);
                        }
                    }
                    for item in items(arg) {
                        let index = self
                            .find(target, &item)?
                            .ok_or_else(|| DatabaseError::NotFound(format!("{} matching {}", target, item)))?;
                        self.table(target)[index].insert(fk.to_string(), parent_id.clone());
                    }
                }
                "connectOrCreate" => {
                    for item in items(arg) {
                        let mut body = into_record(item)?;
                        let where_clause = body.remove("where").unwrap_or(Value::Null);
                        match self.find(target, &where_clause)? {
                            Some(index) => {
                                self.table(target)[index].insert(fk.to_string(), parent_id.clone());
                            }
                            None => {
                                let mut record = into_record(body.remove("create").unwrap_or(Value::Null))?;
                                record.insert(fk.to_string(), parent_id.clone());
                                self.create(target, record)?;
                            }
                        }
                    }
                }
                other => return Err(unsupported(other)),
            }
        }
        Ok(())
    }

    fn existing_id(&mut self, model: &str, where_clause: &Value) -> Result<Value, TenantError> {
        let index = self
            .find(model, where_clause)?
            .ok_or_else(|| DatabaseError::NotFound(format!("{} matching {}", model, where_clause)))?;
        Ok(self.table(model)[index].get("id").cloned().unwrap_or(Value::Null))
    }
}

fn unsupported(instruction: &str) -> TenantError {
    TenantError::Database(DatabaseError::QueryError(format!("unsupported nested write '{}'", instruction)))
}

fn into_record(value: Value) -> Result<Record, TenantError> {
    match value {
        Value::Object(record) => Ok(record),
        other => Err(TenantError::Database(DatabaseError::QueryError(format!("expected an object, got {}", other)))),
    }
}

fn items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => vec![],
        item => vec![item],
    }
}

/// Evaluate the JSON filter language against one row
pub fn matches(row: &Record, filter: &Value) -> Result<bool, TenantError> {
    match filter {
        Value::Null => Ok(true),
        Value::Object(conditions) => {
            for (key, value) in conditions {
                let ok = match key.as_str() {
                    "$and" => {
                        let mut all = true;
                        for branch in value.as_array().into_iter().flatten() {
                            all &= matches(row, branch)?;
                        }
                        all
                    }
                    "$or" => {
                        let branches = value.as_array().map(Vec::as_slice).unwrap_or(&[]);
                        let mut any = false;
                        for branch in branches {
                            any |= matches(row, branch)?;
                        }
                        any
                    }
                    "$not" => !matches(row, value)?,
                    field => field_matches(row.get(field), value)?,
                };
                if !ok {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        other => Err(TenantError::Database(DatabaseError::QueryError(format!(
            "unsupported filter {}",
            other
        )))),
    }
}

fn field_matches(actual: Option<&Value>, expected: &Value) -> Result<bool, TenantError> {
    let actual = actual.unwrap_or(&Value::Null);
    let Value::Object(ops) = expected else {
        return Ok(actual == expected);
    };

    for (op_key, arg) in ops {
        let op = FilterOp::parse(op_key)
            .ok_or_else(|| TenantError::Database(DatabaseError::QueryError(format!("unsupported operator {}", op_key))))?;
        let ok = match op {
            FilterOp::Eq => actual == arg,
            FilterOp::Ne => actual != arg,
            FilterOp::Gt => compare(Some(actual), Some(arg)) == Ordering::Greater && !actual.is_null(),
            FilterOp::Gte => compare(Some(actual), Some(arg)) != Ordering::Less && !actual.is_null(),
            FilterOp::Lt => compare(Some(actual), Some(arg)) == Ordering::Less && !actual.is_null(),
            FilterOp::Lte => compare(Some(actual), Some(arg)) != Ordering::Greater && !actual.is_null(),
            FilterOp::Like | FilterOp::ILike => match (actual.as_str(), arg.as_str()) {
                (Some(text), Some(pattern)) if op == FilterOp::ILike => like(&pattern.to_lowercase(), &text.to_lowercase()),
                (Some(text), Some(pattern)) => like(pattern, text),
                _ => false,
            },
            FilterOp::In => arg.as_array().map(|a| a.contains(actual)).unwrap_or(false),
            FilterOp::NIn => arg.as_array().map(|a| !a.contains(actual)).unwrap_or(true),
            FilterOp::Between => match arg.as_array().map(Vec::as_slice) {
                Some([low, high]) => {
                    !actual.is_null()
                        && compare(Some(actual), Some(low)) != Ordering::Less
                        && compare(Some(actual), Some(high)) != Ordering::Greater
                }
                _ => false,
            },
            FilterOp::Null => arg.as_bool() == Some(actual.is_null()),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// SQL LIKE with `%` and `_` wildcards
fn like(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let mut dp = vec![vec![false; t.len() + 1]; p.len() + 1];
    dp[0][0] = true;
    for i in 1..=p.len() {
        if p[i - 1] == '%' {
            dp[i][0] = dp[i - 1][0];
        }
        for j in 1..=t.len() {
            dp[i][j] = match p[i - 1] {
                '%' => dp[i - 1][j] || dp[i][j - 1],
                '_' => dp[i - 1][j - 1],
                c => dp[i - 1][j - 1] && c == t[j - 1],
            };
        }
    }
    dp[p.len()][t.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn filter_evaluation() {
        let r = row(json!({"name": "prod-eu", "replicas": 3, "deleted_at": null}));
        assert!(matches(&r, &json!({"name": {"$like": "prod-%"}})).unwrap());
        assert!(matches(&r, &json!({"name": {"$ilike": "PROD%"}})).unwrap());
        assert!(matches(&r, &json!({"replicas": {"$between": [1, 3]}})).unwrap());
        assert!(matches(&r, &json!({"deleted_at": {"$null": true}, "missing": null})).unwrap());
        assert!(matches(&r, &json!({"$or": [{"name": "x"}, {"replicas": {"$gt": 2}}]})).unwrap());
        assert!(!matches(&r, &json!({"$not": {"name": {"$in": ["prod-eu"]}}})).unwrap());
        assert!(matches(&r, &json!("1=1")).is_err());
    }

    #[tokio::test]
    async fn nested_create_links_children() {
        let client = MemoryQueryClient::new();
        client
            .query(
                "clusters",
                Query::create(json!({"id": "c1", "deployments": {"create": [{"name": "api"}, {"name": "web"}]}})).unwrap(),
            )
            .await
            .unwrap();
        let deployments = client.rows("deployments");
        assert_eq!(deployments.len(), 2);
        assert!(deployments.iter().all(|d| d["cluster_id"] == json!("c1")));
    }

    #[tokio::test]
    async fn failed_nested_write_rolls_back() {
        let client = MemoryQueryClient::new();
        let err = client
            .query("deployments", Query::create(json!({"name": "api", "cluster": {"connect": {"id": "missing"}}})).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TenantError::Database(DatabaseError::NotFound(_))));
        assert!(client.rows("deployments").is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let client = MemoryQueryClient::new();
        client.fail_next(1);
        assert!(client.query("clusters", Query::count(Value::Null)).await.unwrap_err().is_retryable());
        assert_eq!(client.query("clusters", Query::count(Value::Null)).await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn group_by_and_aggregate() {
        let client = MemoryQueryClient::new();
        for (status, replicas) in [("active", 2), ("active", 3), ("paused", 1)] {
            client.insert_row("deployments", json!({"status": status, "replicas": replicas}));
        }
        let groups = client
            .query("deployments", Query::GroupBy { filter: FilterData::default(), by: vec!["status".into()] })
            .await
            .unwrap();
        assert_eq!(groups, json!([{"status": "active", "_count": 2}, {"status": "paused", "_count": 1}]));

        let total = client
            .query(
                "deployments",
                Query::Aggregate {
                    filter: FilterData::default(),
                    function: AggregateFunction::Sum,
                    field: Some("replicas".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(total.as_f64(), Some(6.0));
    }
}
