pub mod client;
pub mod models;
pub mod query;
pub mod scope;

pub use client::{QueryClient, TenantScopedClient};
pub use models::{ModelRegistry, Relation, RelationKind, WriteAccess, ORG_COLUMN};
pub use query::{count_result, AggregateFunction, Query, Record, UniqueWhere};
pub use scope::{ReferenceCheck, ScopePlan, Scoper};
