mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use common::{memberships, rows_of, scoped, seeded_database, ACME};
use orgscope_api::interceptor::QueryClient;
use orgscope_api::jobs::{BulkSyncJob, JobEnvelope, JobError, JobHandler, JobOutcome, JobQueue, JobRegistry, JobWorker};
use orgscope_api::tenant::{current_context, EstablishedJob, JobContextEstablisher, JobPayload};
use orgscope_api::testing::{MemoryAuditSink, MemoryMembershipStore, MemoryQueryClient};

/// Reports the bound context and counts how often its body ran
#[derive(Default)]
struct Tally {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for Tally {
    fn action(&self) -> &'static str {
        "tally"
    }

    async fn run(&self, job_id: &str, job: &EstablishedJob) -> Result<Value, JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let ctx = current_context()?;
        Ok(json!({
            "job_id": job_id,
            "organization_id": ctx.organization_id(),
            "user_id": ctx.user_id(),
            "role": ctx.user_role(),
            "request_id": ctx.request_id(),
            "args": Value::Object(job.payload.args.clone()),
        }))
    }
}

struct Harness {
    db: Arc<MemoryQueryClient>,
    memberships: Arc<MemoryMembershipStore>,
    audit: Arc<MemoryAuditSink>,
    tally_runs: Arc<AtomicUsize>,
    worker: JobWorker,
    queue: JobQueue,
    receiver: Option<tokio::sync::mpsc::Receiver<JobEnvelope>>,
}

async fn harness() -> Harness {
    let db = seeded_database();
    let memberships = memberships().await;
    let audit = Arc::new(MemoryAuditSink::new());
    let client: Arc<dyn QueryClient> = Arc::new(scoped(&db));

    let tally = Tally::default();
    let tally_runs = Arc::clone(&tally.runs);
    let mut registry = JobRegistry::new();
    registry.register(BulkSyncJob::new(client, audit.clone()));
    registry.register(tally);

    let (queue, receiver) = JobQueue::bounded(16);
    let worker = JobWorker::new(
        JobContextEstablisher::new(memberships.clone()),
        Arc::new(registry),
        queue.clone(),
    )
    .with_retry_policy(3, Duration::from_millis(5));

    Harness {
        db,
        memberships,
        audit,
        tally_runs,
        worker,
        queue,
        receiver: Some(receiver),
    }
}

fn envelope(user_id: &str, action: &str) -> JobEnvelope {
    JobEnvelope::new(JobPayload::new(ACME, user_id, action).to_value())
}

fn permanent_kind(outcome: &JobOutcome) -> Option<&str> {
    match outcome {
        JobOutcome::Failed(JobError::Permanent(msg)) => msg.split(':').next(),
        _ => None,
    }
}

#[tokio::test]
async fn bulk_sync_runs_inside_the_job_organization() -> Result<()> {
    let h = harness().await;
    let job = envelope("u-writer", "bulk_sync");

    let outcome = h.worker.process(&job).await;
    let JobOutcome::Completed(result) = outcome else {
        panic!("job did not complete: {:?}", outcome);
    };
    assert_eq!(result["clusters"], json!(2));

    let operations = rows_of(&h.db, "bulk_operations", ACME);
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0]["job_id"], json!(job.id));
    assert_eq!(operations[0]["user_id"], json!("u-writer"));
    assert_eq!(result["bulk_operation_id"], operations[0]["id"]);

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].organization_id, ACME);
    assert_eq!(entries[0].action, "bulk_sync");
    assert!(entries[0].request_id.starts_with(&format!("job:{}:1:", job.id)));
    Ok(())
}

#[tokio::test]
async fn revoked_membership_stops_the_job_before_its_body() -> Result<()> {
    let h = harness().await;
    let bulk = envelope("u-writer", "bulk_sync");
    let tally = envelope("u-writer", "tally");

    // Enqueued while the membership existed, revoked before pickup
    h.memberships.revoke("u-writer", ACME).await;

    let outcome = h.worker.process(&bulk).await;
    assert_eq!(permanent_kind(&outcome), Some("membership_not_found"), "{:?}", outcome);
    let outcome = h.worker.process(&tally).await;
    assert_eq!(permanent_kind(&outcome), Some("membership_not_found"), "{:?}", outcome);

    assert_eq!(h.tally_runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.db.calls(), 0);
    assert!(h.db.rows("bulk_operations").is_empty());
    assert!(h.audit.entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn handler_sees_fresh_context_from_the_membership_table() -> Result<()> {
    let h = harness().await;
    let mut job = envelope("u-reader", "tally");
    job.payload["clusterIds"] = json!(["c-acme-1"]);

    let JobOutcome::Completed(first) = h.worker.process(&job).await else {
        panic!("tally failed");
    };
    assert_eq!(first["organization_id"], json!(ACME));
    assert_eq!(first["role"], json!("USER"));
    assert_eq!(first["args"], json!({"clusterIds": ["c-acme-1"]}));

    // A role change is picked up by the next attempt, with a new request id
    h.memberships.grant("u-reader", ACME, "acme", orgscope_api::tenant::Role::Admin).await;
    let JobOutcome::Completed(second) = h.worker.process(&job.next_attempt()).await else {
        panic!("tally failed");
    };
    assert_eq!(second["role"], json!("ADMIN"));
    assert_ne!(first["request_id"], second["request_id"]);
    assert_eq!(h.tally_runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn malformed_payloads_and_unknown_actions_are_permanent() -> Result<()> {
    let h = harness().await;

    let malformed = JobEnvelope::new(json!({"organizationId": ACME, "action": "bulk_sync"}));
    let outcome = h.worker.process(&malformed).await;
    assert_eq!(permanent_kind(&outcome), Some("invalid_job_payload"), "{:?}", outcome);
    assert_eq!(h.memberships.lookups(), 0);

    let outcome = h.worker.process(&envelope("u-writer", "reindex")).await;
    assert!(matches!(outcome, JobOutcome::Failed(JobError::Permanent(_))), "{:?}", outcome);
    Ok(())
}

#[tokio::test]
async fn insufficient_role_fails_inside_the_job() -> Result<()> {
    let h = harness().await;

    let outcome = h.worker.process(&envelope("u-reader", "bulk_sync")).await;
    assert_eq!(permanent_kind(&outcome), Some("role_insufficient"), "{:?}", outcome);
    assert!(h.db.rows("bulk_operations").is_empty());
    Ok(())
}

#[tokio::test]
async fn transient_database_failures_are_retried() -> Result<()> {
    let h = harness().await;
    let job = envelope("u-writer", "bulk_sync");

    h.db.fail_next(1);
    let outcome = h.worker.process(&job).await;
    assert_eq!(
        outcome,
        JobOutcome::Retry {
            attempt: 2,
            delay: Duration::from_millis(5)
        }
    );

    let outcome = h.worker.process(&job.next_attempt()).await;
    assert!(matches!(outcome, JobOutcome::Completed(_)), "{:?}", outcome);
    assert_eq!(rows_of(&h.db, "bulk_operations", ACME).len(), 1);

    // Out of attempts: the transient error becomes the final outcome
    h.db.fail_next(1);
    let last = job.next_attempt().next_attempt();
    let outcome = h.worker.process(&last).await;
    assert!(matches!(outcome, JobOutcome::Failed(JobError::Retryable(_))), "{:?}", outcome);
    Ok(())
}

#[tokio::test]
async fn worker_loop_drains_the_queue_and_retries() -> Result<()> {
    let mut h = harness().await;
    let receiver = h.receiver.take().expect("receiver");
    let db = Arc::clone(&h.db);
    let queue = h.queue.clone();

    h.db.fail_next(1);
    let worker = tokio::spawn(h.worker.run(receiver));
    let job_id = queue.enqueue(&JobPayload::new(ACME, "u-admin", "bulk_sync")).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.audit.entries().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "job never completed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let operations = rows_of(&db, "bulk_operations", ACME);
    assert_eq!(operations[0]["job_id"], json!(job_id));
    let entries = h.audit.entries();
    assert!(entries[0].request_id.starts_with(&format!("job:{}:2:", job_id)), "{:?}", entries);

    // The worker holds no queue handle of its own, so it stops with the last sender
    drop(queue);
    drop(h.queue);
    tokio::time::timeout(Duration::from_secs(5), worker).await??;
    Ok(())
}
