pub mod app;
pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod interceptor;
pub mod jobs;
pub mod middleware;
pub mod tenant;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
