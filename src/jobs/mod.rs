pub mod bulk_sync;
pub mod error;
pub mod queue;
pub mod worker;

pub use bulk_sync::BulkSyncJob;
pub use error::JobError;
pub use queue::{JobEnvelope, JobQueue, WeakJobQueue};
pub use worker::{JobOutcome, JobWorker};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::tenant::EstablishedJob;

/// A unit of background work addressed by its payload `action`.
///
/// `run` is only ever called with the job's context already bound on the current task.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn action(&self) -> &'static str;

    async fn run(&self, job_id: &str, job: &EstablishedJob) -> Result<Value, JobError>;
}

#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: JobHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.action().to_string(), Arc::new(handler));
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }
}
