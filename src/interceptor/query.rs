use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::filter::FilterData;
use crate::tenant::TenantError;
use crate::types::Operation;

pub type Record = Map<String, Value>;

/// Unique-key lookup. Tenant-owned models only accept a compound key carrying
/// `organization_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum UniqueWhere {
    Field { field: String, value: Value },
    Compound(Record),
}

impl UniqueWhere {
    pub fn field(field: impl Into<String>, value: impl Into<Value>) -> Self {
        UniqueWhere::Field {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn compound<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        UniqueWhere::Compound(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Equality predicate over every key field
    pub fn to_where(&self) -> Value {
        match self {
            UniqueWhere::Field { field, value } => {
                let mut obj = Map::new();
                obj.insert(field.clone(), value.clone());
                Value::Object(obj)
            }
            UniqueWhere::Compound(fields) => Value::Object(fields.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateFunction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Count => "COUNT",
        }
    }
}

/// Every operation the data layer understands. Results are JSON:
/// rows for reads, the written row for single writes, `{"count": n}` for batches.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    FindMany(FilterData),
    FindFirst(FilterData),
    FindUnique(UniqueWhere),
    Count(FilterData),
    Aggregate {
        filter: FilterData,
        function: AggregateFunction,
        field: Option<String>,
    },
    GroupBy {
        filter: FilterData,
        by: Vec<String>,
    },
    Create(Record),
    CreateMany(Vec<Record>),
    Update {
        where_clause: Value,
        data: Record,
    },
    UpdateMany {
        where_clause: Value,
        data: Record,
    },
    Delete {
        where_clause: Value,
    },
    DeleteMany {
        where_clause: Value,
    },
    Upsert {
        where_clause: Value,
        create: Record,
        update: Record,
    },
}

impl Query {
    pub fn operation(&self) -> Operation {
        match self {
            Query::FindMany(_) => Operation::FindMany,
            Query::FindFirst(_) => Operation::FindFirst,
            Query::FindUnique(_) => Operation::FindUnique,
            Query::Count(_) => Operation::Count,
            Query::Aggregate { .. } => Operation::Aggregate,
            Query::GroupBy { .. } => Operation::GroupBy,
            Query::Create(_) => Operation::Create,
            Query::CreateMany(_) => Operation::CreateMany,
            Query::Update { .. } => Operation::Update,
            Query::UpdateMany { .. } => Operation::UpdateMany,
            Query::Delete { .. } => Operation::Delete,
            Query::DeleteMany { .. } => Operation::DeleteMany,
            Query::Upsert { .. } => Operation::Upsert,
        }
    }

    pub fn find_many(where_clause: Value) -> Self {
        Query::FindMany(FilterData::with_where(where_clause))
    }

    pub fn count(where_clause: Value) -> Self {
        Query::Count(FilterData::with_where(where_clause))
    }

    /// Builds a `Create` from a JSON object; any other shape is rejected
    pub fn create(data: Value) -> Result<Self, TenantError> {
        Ok(Query::Create(into_record(data, "create data")?))
    }

    pub fn update(where_clause: Value, data: Value) -> Result<Self, TenantError> {
        Ok(Query::Update {
            where_clause,
            data: into_record(data, "update data")?,
        })
    }
}

fn into_record(value: Value, what: &str) -> Result<Record, TenantError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(TenantError::InvalidRecord(format!(
            "{} must be a JSON object, got {}",
            what,
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `{"count": n}` result body for batch writes
pub fn count_result(count: u64) -> Value {
    let mut obj = Map::new();
    obj.insert("count".to_string(), Value::from(count));
    Value::Object(obj)
}
