use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::error::JobError;
use crate::tenant::JobPayload;

/// What travels through the queue. The payload stays raw JSON until dequeue so the
/// worker validates its shape like any other external input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub attempt: u32,
    pub payload: Value,
}

impl JobEnvelope {
    pub fn new(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            attempt: 1,
            payload,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            id: self.id.clone(),
            attempt: self.attempt + 1,
            payload: self.payload.clone(),
        }
    }
}

/// Bounded in-process transport. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<JobEnvelope>,
}

impl JobQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<JobEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue a first attempt and return its job id
    pub async fn enqueue(&self, payload: &JobPayload) -> Result<String, JobError> {
        let envelope = JobEnvelope::new(payload.to_value());
        let id = envelope.id.clone();
        debug!(job_id = %id, action = %payload.action, organization_id = %payload.organization_id, "Enqueued job");
        self.send(envelope).await?;
        Ok(id)
    }

    pub async fn send(&self, envelope: JobEnvelope) -> Result<(), JobError> {
        self.sender
            .send(envelope)
            .await
            .map_err(|_| JobError::permanent("job queue is closed"))
    }

    pub fn downgrade(&self) -> WeakJobQueue {
        WeakJobQueue {
            sender: self.sender.downgrade(),
        }
    }
}

/// A queue handle that does not keep the channel open
#[derive(Debug, Clone)]
pub struct WeakJobQueue {
    sender: mpsc::WeakSender<JobEnvelope>,
}

impl WeakJobQueue {
    /// `None` once every `JobQueue` handle has been dropped
    pub fn upgrade(&self) -> Option<JobQueue> {
        self.sender.upgrade().map(|sender| JobQueue { sender })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_wraps_payload_as_first_attempt() {
        let (queue, mut receiver) = JobQueue::bounded(4);
        let id = queue.enqueue(&JobPayload::new("org-acme", "u1", "bulk_sync")).await.unwrap();

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.attempt, 1);
        assert_eq!(envelope.payload["organizationId"], "org-acme");
        assert_eq!(envelope.next_attempt().attempt, 2);
    }

    #[tokio::test]
    async fn weak_handle_does_not_keep_the_queue_open() {
        let (queue, mut receiver) = JobQueue::bounded(1);
        let weak = queue.downgrade();
        assert!(weak.upgrade().is_some());

        drop(queue);
        assert!(weak.upgrade().is_none());
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_queue_is_permanent() {
        let (queue, receiver) = JobQueue::bounded(1);
        drop(receiver);
        let err = queue.enqueue(&JobPayload::new("org-acme", "u1", "bulk_sync")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
