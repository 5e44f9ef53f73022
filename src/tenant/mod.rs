pub mod carrier;
pub mod context;
pub mod error;
pub mod job;
pub mod membership;
pub mod request;
pub mod role_gate;

pub use carrier::{current_context, current_context_or_none, run_with_context, spawn_with_context, sync_with_context};
pub use context::{Role, TenantContext};
pub use error::TenantError;
pub use job::{EstablishedJob, JobContextEstablisher, JobPayload};
pub use membership::{CachedMembershipStore, Membership, MembershipStore, PgMembershipStore};
pub use request::{RequestContextEstablisher, RequestMetadata};
pub use role_gate::require_role;
