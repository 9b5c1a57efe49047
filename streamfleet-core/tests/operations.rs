use std::sync::Arc;

use serde_json::json;
use streamfleet_core::config::OperationsSection;
use streamfleet_core::{
    Clock, ManualClock, MemoryStore, OperationKind, OperationStatus, StreamOperationQueue,
};

fn queue() -> (StreamOperationQueue, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let queue = StreamOperationQueue::new(store, clock.clone(), OperationsSection::default());
    (queue, clock)
}

#[test]
fn admission_follows_conflict_table() {
    let (queue, _) = queue();
    assert!(queue
        .queue_operation("job-1", OperationKind::StartStream, json!({}))
        .unwrap());

    // START conflicts with START and STOP; UPDATE conflicts with START.
    assert!(!queue
        .queue_operation("job-1", OperationKind::StartStream, json!({}))
        .unwrap());
    assert!(!queue
        .queue_operation("job-1", OperationKind::StopStream, json!({}))
        .unwrap());
    assert!(!queue
        .queue_operation("job-1", OperationKind::UpdateStream, json!({}))
        .unwrap());
    // RESTART conflicts with nothing.
    assert!(queue
        .queue_operation("job-1", OperationKind::RestartStream, json!({}))
        .unwrap());

    // Other jobs are independent.
    assert!(queue
        .queue_operation("job-2", OperationKind::StopStream, json!({}))
        .unwrap());
    assert!(!queue
        .queue_operation("job-2", OperationKind::StopStream, json!({}))
        .unwrap());
}

#[test]
fn processing_operation_still_blocks_conflicts() {
    let (queue, _) = queue();
    queue
        .queue_operation("job-1", OperationKind::StartStream, json!({}))
        .unwrap();
    let op = queue.process_next("job-1").unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Processing);
    assert!(!queue
        .queue_operation("job-1", OperationKind::StartStream, json!({}))
        .unwrap());

    queue.mark_completed("job-1", &op.id, true).unwrap();
    assert!(queue
        .queue_operation("job-1", OperationKind::StopStream, json!({}))
        .unwrap());
}

#[test]
fn at_most_one_operation_processes_per_job() {
    let (queue, _) = queue();
    queue
        .queue_operation("job-1", OperationKind::UpdateStream, json!({"loop_enabled": true}))
        .unwrap();
    queue
        .queue_operation("job-1", OperationKind::RestartStream, json!({}))
        .unwrap();
    let first = queue.process_next("job-1").unwrap().unwrap();
    assert_eq!(first.kind, OperationKind::RestartStream);
    assert!(queue.process_next("job-1").unwrap().is_none());

    queue.mark_completed("job-1", &first.id, true).unwrap();
    let second = queue.process_next("job-1").unwrap().unwrap();
    assert_eq!(second.kind, OperationKind::UpdateStream);
    assert_eq!(second.payload["loop_enabled"], true);
}

#[test]
fn stop_outranks_everything_else() {
    let (queue, _) = queue();
    queue
        .queue_operation("job-1", OperationKind::UpdateStream, json!({}))
        .unwrap();
    queue
        .queue_operation("job-1", OperationKind::RestartStream, json!({}))
        .unwrap();
    let status = queue.get_status("job-1").unwrap();
    let priorities: Vec<i64> = status.queued.iter().map(|op| op.priority).collect();
    assert_eq!(priorities, vec![85, 80]);

    let (queue, _) = self::queue();
    queue
        .queue_operation("job-9", OperationKind::RestartStream, json!({}))
        .unwrap();
    queue
        .queue_operation("job-9", OperationKind::StopStream, json!({}))
        .unwrap();
    let next = queue.process_next("job-9").unwrap().unwrap();
    assert_eq!(next.kind, OperationKind::StopStream);
    assert_eq!(next.priority, 100);
}

#[test]
fn failures_back_off_then_fail_permanently() {
    let (queue, clock) = queue();
    queue
        .queue_operation("job-1", OperationKind::StartStream, json!({}))
        .unwrap();

    let expected = [(1, 10, 89), (2, 20, 88)];
    for (retry_count, delay, priority) in expected {
        let op = queue.process_next("job-1").unwrap().unwrap();
        assert!(queue.mark_failed("job-1", &op.id, "ssh timeout").unwrap());

        let status = queue.get_status("job-1").unwrap();
        let requeued = &status.queued[0];
        assert_eq!(requeued.retry_count, retry_count);
        assert_eq!(requeued.priority, priority);
        assert_eq!(requeued.not_before, Some(clock.now() + chrono::Duration::seconds(delay)));
        assert_eq!(requeued.last_error.as_deref(), Some("ssh timeout"));

        clock.advance_secs(delay - 1);
        assert!(queue.process_next("job-1").unwrap().is_none(), "still backing off");
        clock.advance_secs(1);
    }

    let op = queue.process_next("job-1").unwrap().unwrap();
    assert!(!queue.mark_failed("job-1", &op.id, "ssh timeout").unwrap());
    let status = queue.get_status("job-1").unwrap();
    assert!(status.queued.is_empty());
    assert!(status.processing.is_none());
    assert_eq!(status.history.len(), 1);
    assert_eq!(status.history[0].status, OperationStatus::Failed);
    assert_eq!(status.history[0].retry_count, 3);

    // Never re-queued again.
    assert!(!queue.mark_failed("job-1", &op.id, "ssh timeout").unwrap());
    assert!(queue.process_next("job-1").unwrap().is_none());
}

#[test]
fn stale_processing_marker_expires() {
    let (queue, clock) = queue();
    queue
        .queue_operation("job-1", OperationKind::StopStream, json!({}))
        .unwrap();
    let op = queue.process_next("job-1").unwrap().unwrap();
    assert!(!queue
        .queue_operation("job-1", OperationKind::StopStream, json!({}))
        .unwrap());

    clock.advance_secs(301);
    assert!(queue.get_status("job-1").unwrap().processing.is_none());
    assert!(queue
        .queue_operation("job-1", OperationKind::StopStream, json!({}))
        .unwrap());
    // A late completion for the expired operation is ignored.
    queue.mark_completed("job-1", &op.id, true).unwrap();
    assert!(queue.get_status("job-1").unwrap().history.is_empty());
}

#[test]
fn queue_entries_expire_after_five_minutes() {
    let (queue, clock) = queue();
    queue
        .queue_operation("job-1", OperationKind::StartStream, json!({}))
        .unwrap();
    clock.advance_secs(301);
    assert!(queue.process_next("job-1").unwrap().is_none());
    assert!(queue
        .queue_operation("job-1", OperationKind::StartStream, json!({}))
        .unwrap());
}

#[test]
fn history_is_bounded() {
    let (queue, _) = queue();
    for _ in 0..105 {
        queue
            .queue_operation("job-1", OperationKind::RestartStream, json!({}))
            .unwrap();
        let op = queue.process_next("job-1").unwrap().unwrap();
        queue.mark_completed("job-1", &op.id, true).unwrap();
    }
    let status = queue.get_status("job-1").unwrap();
    assert_eq!(status.history.len(), 100);
    assert!(status
        .history
        .iter()
        .all(|op| op.status == OperationStatus::Completed));
}

#[test]
fn clear_operations_drops_queue_and_marker() {
    let (queue, _) = queue();
    queue
        .queue_operation("job-1", OperationKind::StartStream, json!({}))
        .unwrap();
    queue
        .queue_operation("job-1", OperationKind::RestartStream, json!({}))
        .unwrap();
    queue.process_next("job-1").unwrap().unwrap();
    assert_eq!(queue.clear_operations("job-1").unwrap(), 2);
    let status = queue.get_status("job-1").unwrap();
    assert!(status.queued.is_empty());
    assert!(status.processing.is_none());
}
