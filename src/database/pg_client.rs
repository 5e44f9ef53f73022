use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::sync::Arc;

use super::manager::{DatabaseError, DatabaseManager};
use crate::filter::{Filter, FilterData, SqlResult};
use crate::interceptor::{count_result, ModelRegistry, Query, QueryClient, Record, Relation, RelationKind};
use crate::tenant::TenantError;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Executes `Query` values against Postgres. Rows come back as JSON via `to_jsonb`;
/// writes are typed by the table itself through `jsonb_populate_record`.
///
/// This client does no tenant scoping. Wrap it in `TenantScopedClient`.
pub struct PgQueryClient {
    pool: PgPool,
    registry: Arc<ModelRegistry>,
}

impl PgQueryClient {
    pub fn new(pool: PgPool, registry: Arc<ModelRegistry>) -> Self {
        Self { pool, registry }
    }

    pub async fn connect(registry: Arc<ModelRegistry>) -> Result<Self, DatabaseError> {
        Ok(Self::new(DatabaseManager::pool().await?, registry))
    }

    async fn execute(&self, conn: &mut PgConnection, model: &str, query: Query) -> Result<Value, TenantError> {
        match query {
            Query::FindMany(filter) => {
                let sql = Filter::from_data(model, filter)?.to_sql()?;
                Ok(Value::Array(fetch_rows(conn, sql).await?))
            }
            Query::FindFirst(mut filter) => {
                filter.limit = Some(1);
                let sql = Filter::from_data(model, filter)?.to_sql()?;
                Ok(fetch_rows(conn, sql).await?.into_iter().next().unwrap_or(Value::Null))
            }
            Query::FindUnique(key) => Ok(self.first(conn, model, key.to_where()).await?.unwrap_or(Value::Null)),
            Query::Count(filter) => {
                let sql = Filter::from_data(model, filter)?.to_count_sql()?;
                let mut q = sqlx::query(&sql.query);
                for param in sql.params {
                    q = bind_value(q, param);
                }
                let row = q.fetch_one(&mut *conn).await.map_err(DatabaseError::from)?;
                let count: i64 = row.try_get("count").map_err(DatabaseError::from)?;
                Ok(Value::from(count))
            }
            Query::Aggregate { filter, function, field } => {
                let sql = Filter::from_data(model, filter)?.to_aggregate_sql(function.as_sql(), field.as_deref())?;
                let mut q = sqlx::query(&sql.query);
                for param in sql.params {
                    q = bind_value(q, param);
                }
                let row = q.fetch_one(&mut *conn).await.map_err(DatabaseError::from)?;
                let value: Option<Value> = row.try_get("value").map_err(DatabaseError::from)?;
                Ok(value.unwrap_or(Value::Null))
            }
            Query::GroupBy { filter, by } => {
                let sql = Filter::from_data(model, filter)?.to_group_by_sql(&by)?;
                Ok(Value::Array(fetch_rows(conn, sql).await?))
            }
            Query::Create(record) => self.create(conn, model, record).await,
            Query::CreateMany(records) => {
                let count = records.len() as u64;
                for record in records {
                    self.create(&mut *conn, model, record).await?;
                }
                Ok(count_result(count))
            }
            Query::Update { where_clause, data } => self.update(conn, model, where_clause, data).await,
            Query::UpdateMany { where_clause, data } => {
                let (plain, to_one, to_many) = self.split_relations(model, data);
                if !to_one.is_empty() || !to_many.is_empty() {
                    return Err(unsupported("nested write in updateMany"));
                }
                self.update_plain(conn, model, where_clause, plain, false).await
            }
            Query::Delete { where_clause } => {
                let filter = where_filter(model, where_clause)?;
                let where_sql = filter.to_where_sql(0)?;
                let sql = format!(
                    "DELETE FROM \"{m}\" AS t WHERE \"id\" = (SELECT \"id\" FROM \"{m}\" WHERE {w} LIMIT 1) RETURNING to_jsonb(t) AS row",
                    m = model,
                    w = where_sql.query
                );
                Ok(fetch_returning(conn, &sql, where_sql.params).await?.unwrap_or(Value::Null))
            }
            Query::DeleteMany { where_clause } => {
                let where_sql = where_filter(model, where_clause)?.to_where_sql(0)?;
                let sql = format!("DELETE FROM \"{}\" WHERE {}", model, where_sql.query);
                Ok(count_result(execute_statement(conn, &sql, where_sql.params).await?))
            }
            Query::Upsert { where_clause, create, update } => {
                if self.first(&mut *conn, model, where_clause.clone()).await?.is_some() {
                    self.update(conn, model, where_clause, update).await
                } else {
                    self.create(conn, model, create).await
                }
            }
        }
    }

    async fn first(&self, conn: &mut PgConnection, model: &str, where_clause: Value) -> Result<Option<Value>, TenantError> {
        let filter = FilterData {
            where_clause: Some(where_clause),
            limit: Some(1),
            ..Default::default()
        };
        let sql = Filter::from_data(model, filter)?.to_sql()?;
        Ok(fetch_rows(conn, sql).await?.into_iter().next())
    }

    /// Separate relation instructions from column values
    fn split_relations(&self, model: &str, mut record: Record) -> (Record, Vec<(Relation, Value)>, Vec<(Relation, Value)>) {
        let mut to_one = vec![];
        let mut to_many = vec![];
        if let Some(def) = self.registry.model(model) {
            for relation in &def.relations {
                if let Some(instructions) = record.remove(&relation.name) {
                    match relation.kind {
                        RelationKind::BelongsTo => to_one.push((relation.clone(), instructions)),
                        RelationKind::HasMany => to_many.push((relation.clone(), instructions)),
                    }
                }
            }
        }
        (record, to_one, to_many)
    }

    fn create<'a>(&'a self, conn: &'a mut PgConnection, model: &'a str, record: Record) -> BoxFuture<'a, Result<Value, TenantError>> {
        Box::pin(async move {
            let (mut plain, to_one, to_many) = self.split_relations(model, record);
            for (relation, instructions) in to_one {
                let id = self.resolve_parent(&mut *conn, &relation, instructions).await?;
                plain.insert(relation.foreign_key.clone(), id);
            }

            let (sql, params) = insert_sql(model, plain)?;
            let row = fetch_returning(&mut *conn, &sql, params)
                .await?
                .ok_or_else(|| DatabaseError::QueryError(format!("insert into {} returned no row", model)))?;

            let id = row.get("id").cloned().unwrap_or(Value::Null);
            for (relation, instructions) in to_many {
                self.write_children(&mut *conn, &relation, &id, instructions).await?;
            }
            Ok(row)
        })
    }

    async fn update(&self, conn: &mut PgConnection, model: &str, where_clause: Value, data: Record) -> Result<Value, TenantError> {
        let (mut plain, to_one, to_many) = self.split_relations(model, data);
        for (relation, instructions) in to_one {
            let id = self.resolve_parent(&mut *conn, &relation, instructions).await?;
            plain.insert(relation.foreign_key.clone(), id);
        }

        let row = self.update_plain(&mut *conn, model, where_clause, plain, true).await?;
        if !to_many.is_empty() && !row.is_null() {
            let id = row.get("id").cloned().unwrap_or(Value::Null);
            for (relation, instructions) in to_many {
                self.write_children(&mut *conn, &relation, &id, instructions).await?;
            }
        }
        Ok(row)
    }

    /// Column-only update of the first match (`single`) or every match
    async fn update_plain(
        &self,
        conn: &mut PgConnection,
        model: &str,
        where_clause: Value,
        data: Record,
        single: bool,
    ) -> Result<Value, TenantError> {
        let filter = where_filter(model, where_clause.clone())?;
        if data.is_empty() {
            return if single {
                Ok(self.first(conn, model, where_clause).await?.unwrap_or(Value::Null))
            } else {
                let sql = filter.to_count_sql()?;
                let mut q = sqlx::query(&sql.query);
                for param in sql.params {
                    q = bind_value(q, param);
                }
                let row = q.fetch_one(&mut *conn).await.map_err(DatabaseError::from)?;
                let count: i64 = row.try_get("count").map_err(DatabaseError::from)?;
                Ok(count_result(count.max(0) as u64))
            };
        }

        let columns = quoted_columns(&data)?;
        let where_sql = filter.to_where_sql(1)?;
        let target = if single {
            format!("\"id\" = (SELECT \"id\" FROM \"{}\" WHERE {} LIMIT 1)", model, where_sql.query)
        } else {
            where_sql.query
        };
        let sql = format!(
            "UPDATE \"{m}\" AS t SET ({c}) = (SELECT {c} FROM jsonb_populate_record(NULL::\"{m}\", $1)) WHERE {w}",
            m = model,
            c = columns,
            w = target
        );

        let mut params = vec![Value::Object(data)];
        params.extend(where_sql.params);
        if single {
            let sql = format!("{} RETURNING to_jsonb(t) AS row", sql);
            Ok(fetch_returning(conn, &sql, params).await?.unwrap_or(Value::Null))
        } else {
            Ok(count_result(execute_statement(conn, &sql, params).await?))
        }
    }

    /// Resolve a to-one nested write to the id its foreign key should hold
    async fn resolve_parent(&self, conn: &mut PgConnection, relation: &Relation, instructions: Value) -> Result<Value, TenantError> {
        let target = relation.target.as_str();
        let mut id = Value::Null;
        for (instruction, arg) in into_record(instructions)? {
            let row = match instruction.as_str() {
                "create" => self.create(&mut *conn, target, into_record(arg)?).await?,
                "connect" => self
                    .first(&mut *conn, target, arg.clone())
                    .await?
                    .ok_or_else(|| DatabaseError::NotFound(format!("{} matching {}", target, arg)))?,
                "connectOrCreate" => {
                    let mut body = into_record(arg)?;
                    let where_clause = body.remove("where").unwrap_or(Value::Null);
                    match self.first(&mut *conn, target, where_clause).await? {
                        Some(row) => row,
                        None => {
                            let create = into_record(body.remove("create").unwrap_or(Value::Null))?;
                            self.create(&mut *conn, target, create).await?
                        }
                    }
                }
                other => return Err(unsupported(other)),
            };
            id = row.get("id").cloned().unwrap_or(Value::Null);
        }
        Ok(id)
    }

    async fn write_children(
        &self,
        conn: &mut PgConnection,
        relation: &Relation,
        parent_id: &Value,
        instructions: Value,
    ) -> Result<(), TenantError> {
        let target = relation.target.as_str();
        let fk = relation.foreign_key.as_str();
        let link = |value: Value| {
            let mut data = Map::new();
            data.insert(fk.to_string(), value);
            data
        };

        for (instruction, arg) in into_record(instructions)? {
            match instruction.as_str() {
                "create" => {
                    for item in items(arg) {
                        let mut record = into_record(item)?;
                        record.insert(fk.to_string(), parent_id.clone());
                        self.create(&mut *conn, target, record).await?;
                    }
                }
                "createMany" => {
                    let mut body = into_record(arg)?;
                    for item in items(body.remove("data").unwrap_or(Value::Null)) {
                        let mut record = into_record(item)?;
                        record.insert(fk.to_string(), parent_id.clone());
                        self.create(&mut *conn, target, record).await?;
                    }
                }
                "connect" | "set" => {
                    if instruction == "set" {
                        let current = Value::Object(link(parent_id.clone()));
                        self.update_plain(&mut *conn, target, current, link(Value::Null), false).await?;
                    }
                    for item in items(arg) {
                        let linked = self.update_plain(&mut *conn, target, item.clone(), link(parent_id.clone()), true).await?;
                        if linked.is_null() {
                            return Err(DatabaseError::NotFound(format!("{} matching {}", target, item)).into());
                        }
                    }
                }
                "connectOrCreate" => {
                    for item in items(arg) {
                        let mut body = into_record(item)?;
                        let where_clause = body.remove("where").unwrap_or(Value::Null);
                        let linked = self
                            .update_plain(&mut *conn, target, where_clause, link(parent_id.clone()), true)
                            .await?;
                        if linked.is_null() {
                            let mut record = into_record(body.remove("create").unwrap_or(Value::Null))?;
                            record.insert(fk.to_string(), parent_id.clone());
                            self.create(&mut *conn, target, record).await?;
                        }
                    }
                }
                other => return Err(unsupported(other)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueryClient for PgQueryClient {
    async fn query(&self, model: &str, query: Query) -> Result<Value, TenantError> {
        Filter::validate_identifier(model)?;

        if query.operation().is_write() {
            let mut tx = self.pool.begin().await.map_err(DatabaseError::from)?;
            let value = self.execute(&mut tx, model, query).await?;
            tx.commit().await.map_err(DatabaseError::from)?;
            Ok(value)
        } else {
            let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
            self.execute(&mut conn, model, query).await
        }
    }
}

fn where_filter(model: &str, where_clause: Value) -> Result<Filter, TenantError> {
    let mut filter = Filter::new(model)?;
    if !where_clause.is_null() {
        filter.where_clause(where_clause)?;
    }
    Ok(filter)
}

fn quoted_columns(record: &Record) -> Result<String, TenantError> {
    let mut columns = Vec::with_capacity(record.len());
    for column in record.keys() {
        Filter::validate_identifier(column)?;
        columns.push(format!("\"{}\"", column));
    }
    Ok(columns.join(", "))
}

fn insert_sql(model: &str, record: Record) -> Result<(String, Vec<Value>), TenantError> {
    if record.is_empty() {
        return Ok((
            format!("INSERT INTO \"{}\" AS t DEFAULT VALUES RETURNING to_jsonb(t) AS row", model),
            vec![],
        ));
    }
    let columns = quoted_columns(&record)?;
    let sql = format!(
        "INSERT INTO \"{m}\" AS t ({c}) SELECT {c} FROM jsonb_populate_record(NULL::\"{m}\", $1) RETURNING to_jsonb(t) AS row",
        m = model,
        c = columns
    );
    Ok((sql, vec![Value::Object(record)]))
}

async fn fetch_rows(conn: &mut PgConnection, sql: SqlResult) -> Result<Vec<Value>, TenantError> {
    let wrapped = format!("SELECT to_jsonb(t) AS row FROM ({}) t", sql.query);
    let mut q = sqlx::query(&wrapped);
    for param in sql.params {
        q = bind_value(q, param);
    }
    let rows = q.fetch_all(&mut *conn).await.map_err(DatabaseError::from)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row.try_get::<Value, _>("row").map_err(DatabaseError::from)?);
    }
    Ok(out)
}

async fn fetch_returning(conn: &mut PgConnection, sql: &str, params: Vec<Value>) -> Result<Option<Value>, TenantError> {
    let mut q = sqlx::query(sql);
    for param in params {
        q = bind_value(q, param);
    }
    let row = q.fetch_optional(&mut *conn).await.map_err(DatabaseError::from)?;
    match row {
        Some(row) => Ok(Some(row.try_get::<Value, _>("row").map_err(DatabaseError::from)?)),
        None => Ok(None),
    }
}

async fn execute_statement(conn: &mut PgConnection, sql: &str, params: Vec<Value>) -> Result<u64, TenantError> {
    let mut q = sqlx::query(sql);
    for param in params {
        q = bind_value(q, param);
    }
    let result = q.execute(&mut *conn).await.map_err(DatabaseError::from)?;
    Ok(result.rows_affected())
}

fn bind_value(q: PgQuery<'_>, value: Value) -> PgQuery<'_> {
    match value {
        Value::Null => q.bind(None::<String>),
        Value::Bool(b) => q.bind(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(n.to_string())
            }
        }
        Value::String(s) => q.bind(s),
        other => q.bind(sqlx::types::Json(other)),
    }
}

fn unsupported(instruction: &str) -> TenantError {
    DatabaseError::QueryError(format!("unsupported nested write '{}'", instruction)).into()
}

fn into_record(value: Value) -> Result<Record, TenantError> {
    match value {
        Value::Object(record) => Ok(record),
        other => Err(DatabaseError::QueryError(format!("expected an object, got {}", other)).into()),
    }
}

fn items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => vec![],
        item => vec![item],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_goes_through_populate_record() {
        let record = json!({"name": "prod", "organization_id": "acme"}).as_object().cloned().unwrap();
        let (sql, params) = insert_sql("clusters", record).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"clusters\" AS t (\"name\", \"organization_id\") SELECT \"name\", \"organization_id\" \
             FROM jsonb_populate_record(NULL::\"clusters\", $1) RETURNING to_jsonb(t) AS row"
        );
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn empty_insert_uses_defaults() {
        let (sql, params) = insert_sql("bulk_operations", Map::new()).unwrap();
        assert!(sql.contains("DEFAULT VALUES"));
        assert!(params.is_empty());
    }

    #[test]
    fn rejects_unsafe_columns() {
        let record = json!({"name\" = 'x'; --": 1}).as_object().cloned().unwrap();
        assert!(matches!(quoted_columns(&record), Err(TenantError::Filter(_))));
    }

    #[test]
    fn where_filter_numbers_after_payload() {
        let filter = where_filter("clusters", json!({"id": "c1", "organization_id": "acme"})).unwrap();
        let sql = filter.to_where_sql(1).unwrap();
        assert_eq!(sql.query, "\"id\" = $2 AND \"organization_id\" = $3");
    }
}
