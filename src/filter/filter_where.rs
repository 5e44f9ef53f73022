use serde_json::{Map, Value};

use super::error::FilterError;
use super::filter::Filter;
use super::types::FilterOp;

/// Translates a JSON predicate into a parameterised SQL condition.
/// Placeholders are numbered from `starting_param_index + 1`.
pub struct FilterWhere {
    param_values: Vec<Value>,
    starting_param_index: usize,
}

impl FilterWhere {
    pub fn new(starting_param_index: usize) -> Self {
        Self {
            param_values: vec![],
            starting_param_index,
        }
    }

    pub fn generate(where_data: &Value, starting_param_index: usize) -> Result<(String, Vec<Value>), FilterError> {
        let mut filter_where = Self::new(starting_param_index);
        let sql = filter_where.build_clause(where_data)?;
        Ok((sql, filter_where.param_values))
    }

    pub fn validate(where_data: &Value) -> Result<(), FilterError> {
        match where_data {
            Value::Null | Value::Object(_) | Value::String(_) => Ok(()),
            _ => Err(FilterError::InvalidWhereClause("WHERE must be object or string".to_string())),
        }
    }

    fn build_clause(&mut self, where_data: &Value) -> Result<String, FilterError> {
        match where_data {
            Value::Null => Ok("1=1".to_string()),
            Value::Object(obj) => {
                let conditions = self.build_object(obj)?;
                if conditions.is_empty() {
                    Ok("1=1".to_string())
                } else {
                    Ok(conditions.join(" AND "))
                }
            }
            Value::String(s) => {
                // Check if raw SQL is allowed in current environment
                if !crate::config::CONFIG.filter.allow_raw_sql {
                    return Err(FilterError::InvalidWhereClause(
                        "Raw SQL queries are disabled in this environment".to_string(),
                    ));
                }
                tracing::warn!("Raw SQL predicate used: {}", s);
                Ok(format!("({})", s))
            }
            _ => Err(FilterError::InvalidWhereClause("Unsupported WHERE format".to_string())),
        }
    }

    fn build_object(&mut self, obj: &Map<String, Value>) -> Result<Vec<String>, FilterError> {
        let mut conditions = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            if key.starts_with('$') {
                conditions.push(self.build_logical(key, value)?);
            } else {
                Filter::validate_identifier(key)?;
                conditions.extend(self.build_field(key, value)?);
            }
        }
        Ok(conditions)
    }

    fn build_logical(&mut self, op: &str, value: &Value) -> Result<String, FilterError> {
        match op {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| FilterError::InvalidOperatorData(format!("{} requires array", op)))?;
                if arr.is_empty() {
                    // Empty conjunction is true, empty disjunction is false
                    return Ok(if op == "$and" { "1=1" } else { "1=0" }.to_string());
                }
                let mut parts = Vec::with_capacity(arr.len());
                for v in arr {
                    parts.push(format!("({})", self.build_clause(v)?));
                }
                let joiner = if op == "$and" { " AND " } else { " OR " };
                Ok(format!("({})", parts.join(joiner)))
            }
            "$not" => Ok(format!("NOT ({})", self.build_clause(value)?)),
            _ => Err(FilterError::UnsupportedOperator(op.to_string())),
        }
    }

    fn build_field(&mut self, field: &str, value: &Value) -> Result<Vec<String>, FilterError> {
        let column = format!("\"{}\"", field);
        match value {
            Value::Object(obj) => {
                let mut out = Vec::with_capacity(obj.len());
                for (op_key, op_val) in obj {
                    let operator = FilterOp::parse(op_key)
                        .ok_or_else(|| FilterError::UnsupportedOperator(op_key.clone()))?;
                    out.push(self.build_condition(&column, operator, op_val)?);
                }
                Ok(out)
            }
            Value::Array(_) => Err(FilterError::InvalidOperatorData(format!(
                "implicit equality on '{}' cannot take an array; use $in",
                field
            ))),
            // Implicit equality: { field: value }
            other => Ok(vec![self.build_condition(&column, FilterOp::Eq, other)?]),
        }
    }

    fn build_condition(&mut self, column: &str, operator: FilterOp, data: &Value) -> Result<String, FilterError> {
        Ok(match operator {
            FilterOp::Eq if data.is_null() => format!("{} IS NULL", column),
            FilterOp::Eq => format!("{} = {}", column, self.param(data)),
            FilterOp::Ne if data.is_null() => format!("{} IS NOT NULL", column),
            FilterOp::Ne => format!("{} IS DISTINCT FROM {}", column, self.param(data)),
            FilterOp::Gt => format!("{} > {}", column, self.param(data)),
            FilterOp::Gte => format!("{} >= {}", column, self.param(data)),
            FilterOp::Lt => format!("{} < {}", column, self.param(data)),
            FilterOp::Lte => format!("{} <= {}", column, self.param(data)),
            FilterOp::Like => format!("{} LIKE {}", column, self.param(data)),
            FilterOp::ILike => format!("{} ILIKE {}", column, self.param(data)),
            FilterOp::In | FilterOp::NIn => {
                let values = data
                    .as_array()
                    .ok_or_else(|| FilterError::InvalidOperatorData("$in/$nin require an array".to_string()))?;
                if values.is_empty() {
                    return Ok(if operator == FilterOp::In { "1=0" } else { "1=1" }.to_string());
                }
                let params: Vec<String> = values.iter().map(|v| self.param(v)).collect();
                let keyword = if operator == FilterOp::In { "IN" } else { "NOT IN" };
                format!("{} {} ({})", column, keyword, params.join(", "))
            }
            FilterOp::Between => match data.as_array().map(|v| v.as_slice()) {
                Some([low, high]) => {
                    format!("{} BETWEEN {} AND {}", column, self.param(low), self.param(high))
                }
                _ => {
                    return Err(FilterError::InvalidOperatorData(
                        "$between requires exactly 2 values".to_string(),
                    ))
                }
            },
            FilterOp::Null => match data.as_bool() {
                Some(true) => format!("{} IS NULL", column),
                Some(false) => format!("{} IS NOT NULL", column),
                None => return Err(FilterError::InvalidOperatorData("$null requires a boolean".to_string())),
            },
        })
    }

    fn param(&mut self, value: &Value) -> String {
        self.param_values.push(value.clone());
        format!("${}", self.starting_param_index + self.param_values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn implicit_equality_and_merge() {
        let (sql, params) =
            FilterWhere::generate(&json!({"status": "active", "organization_id": "acme"}), 0).unwrap();
        assert_eq!(sql, "\"organization_id\" = $1 AND \"status\" = $2");
        assert_eq!(params, vec![json!("acme"), json!("active")]);
    }

    #[test]
    fn numbering_continues_through_nested_logic() {
        let (sql, params) = FilterWhere::generate(
            &json!({"$or": [{"name": "a"}, {"name": {"$in": ["b", "c"]}}], "region": "eu"}),
            2,
        )
        .unwrap();
        assert_eq!(sql, "((\"name\" = $3) OR (\"name\" IN ($4, $5))) AND \"region\" = $6");
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn null_handling() {
        let (sql, params) = FilterWhere::generate(&json!({"deleted_at": null, "owner": {"$ne": null}}), 0).unwrap();
        assert_eq!(sql, "\"deleted_at\" IS NULL AND \"owner\" IS NOT NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn empty_in_matches_nothing() {
        let (sql, _) = FilterWhere::generate(&json!({"id": {"$in": []}}), 0).unwrap();
        assert_eq!(sql, "1=0");
    }

    #[test]
    fn rejects_injection_in_column_names() {
        let err = FilterWhere::generate(&json!({"name\" OR 1=1 --": "x"}), 0).unwrap_err();
        assert!(matches!(err, FilterError::InvalidColumn(_)));
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = FilterWhere::generate(&json!({"name": {"$regex": "x"}}), 0).unwrap_err();
        assert!(matches!(err, FilterError::UnsupportedOperator(_)));
    }
}
