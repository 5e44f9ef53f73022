use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::error::JobError;
use super::queue::{JobEnvelope, JobQueue, WeakJobQueue};
use super::JobRegistry;
use crate::tenant::{run_with_context, JobContextEstablisher};

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    /// Scheduled again as `attempt` after `delay`
    Retry { attempt: u32, delay: Duration },
    Failed(JobError),
}

/// Pulls envelopes off the queue and runs each attempt inside a freshly established context
pub struct JobWorker {
    establisher: JobContextEstablisher,
    registry: Arc<JobRegistry>,
    retries: WeakJobQueue,
    max_attempts: u32,
    backoff: Duration,
}

impl JobWorker {
    pub fn new(establisher: JobContextEstablisher, registry: Arc<JobRegistry>, queue: JobQueue) -> Self {
        let jobs = &crate::config::config().jobs;
        Self {
            establisher,
            registry,
            retries: queue.downgrade(),
            max_attempts: jobs.max_attempts.max(1),
            backoff: jobs.retry_backoff(),
        }
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Run one attempt and classify its result. Does not re-enqueue.
    pub async fn process(&self, envelope: &JobEnvelope) -> JobOutcome {
        let started = Instant::now();
        info!(job_id = %envelope.id, attempt = envelope.attempt, "Job started");

        let result = self.attempt(envelope).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                info!(job_id = %envelope.id, attempt = envelope.attempt, duration_ms, "Job completed");
                JobOutcome::Completed(value)
            }
            Err(e) if e.is_retryable() && envelope.attempt < self.max_attempts => {
                let delay = self.backoff * envelope.attempt;
                warn!(
                    job_id = %envelope.id,
                    attempt = envelope.attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, retrying"
                );
                JobOutcome::Retry {
                    attempt: envelope.attempt + 1,
                    delay,
                }
            }
            Err(e) => {
                error!(job_id = %envelope.id, attempt = envelope.attempt, duration_ms, error = %e, "Job failed");
                JobOutcome::Failed(e)
            }
        }
    }

    async fn attempt(&self, envelope: &JobEnvelope) -> Result<Value, JobError> {
        let job = self
            .establisher
            .establish(&envelope.id, envelope.attempt, &envelope.payload)
            .await?;

        let handler = self
            .registry
            .get(&job.payload.action)
            .ok_or_else(|| JobError::permanent(format!("no handler registered for action '{}'", job.payload.action)))?;

        run_with_context(job.context.clone(), handler.run(&envelope.id, &job)).await
    }

    /// Consume the queue until every `JobQueue` handle outside the worker is dropped.
    /// Each envelope runs on its own task. A scheduled retry holds the queue open until
    /// it has been re-enqueued; an attempt that finishes after the queue closed cannot retry.
    pub async fn run(self, mut receiver: mpsc::Receiver<JobEnvelope>) {
        let worker = Arc::new(self);
        info!(actions = ?worker.registry.actions(), "Job worker started");

        while let Some(envelope) = receiver.recv().await {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                if let JobOutcome::Retry { delay, .. } = worker.process(&envelope).await {
                    let Some(queue) = worker.retries.upgrade() else {
                        warn!(job_id = %envelope.id, attempt = envelope.attempt, "Job queue closed, retry dropped");
                        return;
                    };
                    tokio::time::sleep(delay).await;
                    if let Err(e) = queue.send(envelope.next_attempt()).await {
                        error!(job_id = %envelope.id, error = %e, "Failed to re-enqueue job");
                    }
                }
            });
        }

        info!("Job worker stopped");
    }
}
