use serde_json::Value;

use super::error::FilterError;
use super::filter_order::FilterOrder;
use super::filter_where::FilterWhere;
use super::types::{FilterData, FilterOrderInfo, SqlResult};

pub struct Filter {
    table_name: String,
    select_columns: Vec<String>,
    where_data: Option<Value>,
    order_data: Vec<FilterOrderInfo>,
    limit: Option<i32>,
    offset: Option<i32>,
}

impl Filter {
    pub fn new(table_name: impl Into<String>) -> Result<Self, FilterError> {
        let table_name = table_name.into();
        Self::validate_identifier(&table_name)
            .map_err(|_| FilterError::InvalidTableName(format!("Invalid table name format: {}", table_name)))?;
        Ok(Self {
            table_name,
            select_columns: vec![],
            where_data: None,
            order_data: vec![],
            limit: None,
            offset: None,
        })
    }

    pub fn from_data(table_name: impl Into<String>, data: FilterData) -> Result<Self, FilterError> {
        let mut filter = Self::new(table_name)?;
        filter.assign(data)?;
        Ok(filter)
    }

    pub fn assign(&mut self, data: FilterData) -> Result<&mut Self, FilterError> {
        if let Some(select) = data.select { self.select(select)?; }
        if let Some(where_clause) = data.where_clause { self.where_clause(where_clause)?; }
        if let Some(order) = data.order { self.order(order)?; }
        if let Some(limit) = data.limit { self.limit(limit, data.offset)?; }
        else if let Some(offset) = data.offset { self.offset(offset)?; }
        Ok(self)
    }

    pub fn select(&mut self, columns: Vec<String>) -> Result<&mut Self, FilterError> {
        for column in &columns {
            if column != "*" {
                Self::validate_identifier(column)?;
            }
        }
        self.select_columns = columns;
        Ok(self)
    }

    pub fn where_clause(&mut self, conditions: Value) -> Result<&mut Self, FilterError> {
        FilterWhere::validate(&conditions)?;
        self.where_data = Some(conditions);
        Ok(self)
    }

    pub fn order(&mut self, order_spec: Value) -> Result<&mut Self, FilterError> {
        self.order_data = FilterOrder::validate_and_parse(&order_spec)?;
        Ok(self)
    }

    pub fn limit(&mut self, limit: i32, offset: Option<i32>) -> Result<&mut Self, FilterError> {
        if limit < 0 { return Err(FilterError::InvalidLimit("Limit must be non-negative".to_string())); }

        // Apply max limit from config
        let max_limit = crate::config::CONFIG.filter.max_limit.unwrap_or(i32::MAX);
        let applied_limit = if limit > max_limit {
            if crate::config::CONFIG.filter.debug_logging {
                tracing::warn!("Limit {} exceeds max {}, capping to max", limit, max_limit);
            }
            max_limit
        } else {
            limit
        };

        self.limit = Some(applied_limit);
        if let Some(off) = offset { self.offset(off)?; }
        Ok(self)
    }

    pub fn offset(&mut self, offset: i32) -> Result<&mut Self, FilterError> {
        if offset < 0 { return Err(FilterError::InvalidOffset("Offset must be non-negative".to_string())); }
        self.offset = Some(offset);
        Ok(self)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn to_sql(&self) -> Result<SqlResult, FilterError> {
        let where_result = self.to_where_sql(0)?;
        let query = [
            format!("SELECT {}", self.build_select_clause()),
            format!("FROM \"{}\"", self.table_name),
            format!("WHERE {}", where_result.query),
            FilterOrder::generate(&self.order_data),
            self.build_limit_clause(),
        ].into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ");

        Ok(SqlResult { query, params: where_result.params })
    }

    /// WHERE body only, with placeholders numbered after `starting_param_index`
    pub fn to_where_sql(&self, starting_param_index: usize) -> Result<SqlResult, FilterError> {
        let (query, params) = match &self.where_data {
            Some(where_data) => FilterWhere::generate(where_data, starting_param_index)?,
            None => ("1=1".to_string(), vec![]),
        };
        Ok(SqlResult { query, params })
    }

    pub fn to_count_sql(&self) -> Result<SqlResult, FilterError> {
        let where_result = self.to_where_sql(0)?;
        let query = format!("SELECT COUNT(*) AS count FROM \"{}\" WHERE {}", self.table_name, where_result.query);
        Ok(SqlResult { query, params: where_result.params })
    }

    pub fn to_group_by_sql(&self, by: &[String]) -> Result<SqlResult, FilterError> {
        if by.is_empty() {
            return Err(FilterError::InvalidColumn("groupBy requires at least one column".to_string()));
        }
        for column in by {
            Self::validate_identifier(column)?;
        }
        let columns = by.iter().map(|c| format!("\"{}\"", c)).collect::<Vec<_>>().join(", ");
        let where_result = self.to_where_sql(0)?;
        let query = [
            format!("SELECT {}, COUNT(*) AS \"_count\"", columns),
            format!("FROM \"{}\"", self.table_name),
            format!("WHERE {}", where_result.query),
            format!("GROUP BY {}", columns),
            FilterOrder::generate(&self.order_data),
            self.build_limit_clause(),
        ].into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ");
        Ok(SqlResult { query, params: where_result.params })
    }

    /// `function` must already be one of the whitelisted SQL aggregates
    pub fn to_aggregate_sql(&self, function: &str, field: Option<&str>) -> Result<SqlResult, FilterError> {
        let target = match field {
            Some(column) => {
                Self::validate_identifier(column)?;
                format!("\"{}\"", column)
            }
            None => "*".to_string(),
        };
        let where_result = self.to_where_sql(0)?;
        let query = format!(
            "SELECT to_jsonb({}({})) AS value FROM \"{}\" WHERE {}",
            function, target, self.table_name, where_result.query
        );
        Ok(SqlResult { query, params: where_result.params })
    }

    /// Identifiers are interpolated into SQL, so only [A-Za-z_][A-Za-z0-9_]* passes
    pub fn validate_identifier(name: &str) -> Result<(), FilterError> {
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if valid {
            Ok(())
        } else {
            Err(FilterError::InvalidColumn(format!("Invalid column name format: {}", name)))
        }
    }

    fn build_select_clause(&self) -> String {
        if self.select_columns.is_empty() || self.select_columns.iter().any(|c| c == "*") {
            "*".to_string()
        } else {
            self.select_columns.iter().map(|c| format!("\"{}\"", c)).collect::<Vec<_>>().join(", ")
        }
    }

    fn build_limit_clause(&self) -> String {
        match (self.limit, self.offset) {
            (Some(l), Some(o)) => format!("LIMIT {} OFFSET {}", l, o),
            (Some(l), None) => format!("LIMIT {}", l),
            (None, Some(o)) => format!("OFFSET {}", o),
            (None, None) => String::new(),
        }
    }
}
