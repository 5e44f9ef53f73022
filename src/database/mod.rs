pub mod manager;
pub mod pg_client;

pub use manager::{DatabaseError, DatabaseManager};
pub use pg_client::PgQueryClient;
