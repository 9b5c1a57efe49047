mod common;

use common::{Harness, MB};
use serde_json::{json, Value};
use streamfleet_core::{
    AgentCommand, JobStatus, OperationKind, PlaybackOrder, WorkerError,
};
use tokio_stream::StreamExt;

#[tokio::test]
async fn drives_start_then_stop() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 20.0);
    harness.active_node("vps-b", 4, 40.0);
    harness.job("job-1", 100 * MB);
    let queue = &harness.services.queue;
    let worker = &harness.services.worker;

    assert!(queue
        .queue_operation("job-1", OperationKind::StartStream, Value::Null)
        .unwrap());
    let outcome = worker.drive("job-1").await.unwrap().unwrap();
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.kind, OperationKind::StartStream);

    let repository = harness.services.lifecycle.repository();
    let session = repository.active_session("job-1").unwrap().unwrap();
    assert_eq!(session.node_id, "vps-a");
    assert_eq!(harness.services.registry.load("vps-a").unwrap(), 1);

    assert!(queue
        .queue_operation("job-1", OperationKind::StopStream, json!({"reason": "user request"}))
        .unwrap());
    let outcome = worker.drive("job-1").await.unwrap().unwrap();
    assert!(outcome.success);
    let stopped = repository.session(&session.id).unwrap().unwrap();
    assert_eq!(stopped.stop_reason.as_deref(), Some("user request"));
    assert_eq!(
        repository.job("job-1").unwrap().unwrap().status,
        JobStatus::Stopped
    );
    assert_eq!(harness.services.registry.load("vps-a").unwrap(), 0);

    assert!(worker.drive("job-1").await.unwrap().is_none());
    let status = queue.get_status("job-1").unwrap();
    assert_eq!(status.history.len(), 2);
}

#[tokio::test]
async fn failed_start_is_retried_with_backoff() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 20.0);
    harness.remote.fail_dispatch_on("vps-a");
    harness.job("job-1", 100 * MB);
    let queue = &harness.services.queue;
    let worker = &harness.services.worker;

    queue
        .queue_operation("job-1", OperationKind::StartStream, Value::Null)
        .unwrap();
    let outcome = worker.drive("job-1").await.unwrap().unwrap();
    assert!(!outcome.success);
    assert!(outcome.will_retry);
    assert!(outcome.message.contains("vps-a"));

    // Still in backoff.
    assert!(worker.drive("job-1").await.unwrap().is_none());
    harness.clock.advance_secs(10);
    let outcome = worker.drive("job-1").await.unwrap().unwrap();
    assert!(!outcome.success);
    assert!(outcome.will_retry);

    harness.clock.advance_secs(20);
    let outcome = worker.drive("job-1").await.unwrap().unwrap();
    assert!(!outcome.will_retry);
    let status = queue.get_status("job-1").unwrap();
    assert!(status.queued.is_empty());
    assert_eq!(status.history.len(), 1);
}

#[tokio::test]
async fn missing_job_fails_the_operation() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 20.0);
    harness
        .services
        .queue
        .queue_operation("ghost", OperationKind::StartStream, Value::Null)
        .unwrap();
    let outcome = harness.services.worker.drive("ghost").await.unwrap().unwrap();
    assert!(!outcome.success);
    assert!(outcome.message.contains("ghost"));
}

#[tokio::test]
async fn update_reaches_the_streaming_agent() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 20.0);
    harness.job("job-1", 100 * MB);
    let queue = &harness.services.queue;
    let worker = &harness.services.worker;
    queue
        .queue_operation("job-1", OperationKind::StartStream, Value::Null)
        .unwrap();
    worker.drive("job-1").await.unwrap().unwrap();

    let mut inbox = harness.services.agent.commands("vps-a").await.unwrap();
    queue
        .queue_operation(
            "job-1",
            OperationKind::UpdateStream,
            json!({"loop_enabled": true, "playlist_order": "random"}),
        )
        .unwrap();
    let outcome = worker.drive("job-1").await.unwrap().unwrap();
    assert!(outcome.success, "{}", outcome.message);

    assert_eq!(
        inbox.next().await,
        Some(AgentCommand::SetLoopMode {
            stream_id: "job-1".to_string(),
            enabled: true,
        })
    );
    assert_eq!(
        inbox.next().await,
        Some(AgentCommand::SetPlaybackOrder {
            stream_id: "job-1".to_string(),
            order: PlaybackOrder::Random,
        })
    );
    let job = harness
        .services
        .lifecycle
        .repository()
        .job("job-1")
        .unwrap()
        .unwrap();
    assert!(job.loop_enabled);
    assert_eq!(job.playlist_order, PlaybackOrder::Random);
}

#[test]
fn unavailable_agent_error_names_the_node() {
    let err = WorkerError::AgentUnavailable("vps-a".to_string());
    assert_eq!(err.to_string(), "agent on node vps-a is not listening");
}
