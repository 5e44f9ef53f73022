/// Shared types used across the codebase

use serde::{Deserialize, Serialize};
use std::fmt;

/// Database operations understood by every query client
/// Used by the interceptor for dispatch and by logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    FindMany,
    FindFirst,
    FindUnique,
    Count,
    Aggregate,
    GroupBy,
    Create,
    CreateMany,
    Update,
    UpdateMany,
    Delete,
    DeleteMany,
    Upsert,
}

/// Coarse operation classes; scoping rules are keyed on these
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    ReadMany,
    ReadUnique,
    Create,
    CreateMany,
    Update,
    Delete,
    Upsert,
}

impl Operation {
    pub fn class(&self) -> OperationClass {
        match self {
            Operation::FindMany
            | Operation::FindFirst
            | Operation::Count
            | Operation::Aggregate
            | Operation::GroupBy => OperationClass::ReadMany,
            Operation::FindUnique => OperationClass::ReadUnique,
            Operation::Create => OperationClass::Create,
            Operation::CreateMany => OperationClass::CreateMany,
            Operation::Update | Operation::UpdateMany => OperationClass::Update,
            Operation::Delete | Operation::DeleteMany => OperationClass::Delete,
            Operation::Upsert => OperationClass::Upsert,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.class(), OperationClass::ReadMany | OperationClass::ReadUnique)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::FindMany => "findMany",
            Operation::FindFirst => "findFirst",
            Operation::FindUnique => "findUnique",
            Operation::Count => "count",
            Operation::Aggregate => "aggregate",
            Operation::GroupBy => "groupBy",
            Operation::Create => "create",
            Operation::CreateMany => "createMany",
            Operation::Update => "update",
            Operation::UpdateMany => "updateMany",
            Operation::Delete => "delete",
            Operation::DeleteMany => "deleteMany",
            Operation::Upsert => "upsert",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
