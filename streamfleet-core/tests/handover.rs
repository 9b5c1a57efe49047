mod common;

use chrono::Duration;
use common::{Harness, MB};
use serde_json::json;
use streamfleet_core::{
    AgentCommand, Clock, HandoverCheck, JobStatus, NodeStatus, PlacementRequest, SessionStatus,
    StreamingStrategy, TimerKind, UpdateOutcome, UpdateRequest,
};
use tokio_stream::StreamExt;

fn update() -> UpdateRequest {
    UpdateRequest {
        version: "2.4.0".to_string(),
        update_data: json!({"url": "https://releases.example.com/agent-2.4.0.tar.gz"}),
    }
}

async fn start_job(harness: &Harness, job_id: &str, node_id: &str) -> String {
    let job = harness.job(job_id, 3 * 1024 * MB);
    let node = harness.services.registry.require(node_id).unwrap();
    harness
        .services
        .lifecycle
        .start_on_node(
            &job,
            &node,
            StreamingStrategy::UrlStreaming,
            streamfleet_core::StartKind::Fresh,
        )
        .await
        .unwrap()
        .session_id
}

#[tokio::test]
async fn idle_node_updates_directly() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    let mut inbox = harness.services.agent.commands("vps-a").await.unwrap();

    let outcome = harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Updating {
            node_id: "vps-a".to_string()
        }
    );
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.status, NodeStatus::Updating);

    match inbox.next().await.unwrap() {
        AgentCommand::UpdateAgent {
            vps_id, version, ..
        } => {
            assert_eq!(vps_id, "vps-a");
            assert_eq!(version, "2.4.0");
        }
        other => panic!("unexpected command {other:?}"),
    }

    let timers = harness.services.timers.pending().unwrap();
    assert_eq!(timers.len(), 1);
    assert!(matches!(timers[0].kind, TimerKind::UpdateCompletionCheck { .. }));
    assert_eq!(timers[0].due_at, harness.clock.now() + Duration::seconds(120));
}

#[tokio::test]
async fn missing_agent_defers_direct_update() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    let outcome = harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Deferred { retry_after: 300, .. }));
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.status, NodeStatus::Active);
    assert!(harness.services.timers.pending().unwrap().is_empty());
}

#[tokio::test]
async fn update_without_handover_capacity_is_deferred() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    harness.active_node("vps-b", 2, 30.0);
    harness.services.registry.increment_load("vps-b").unwrap();
    start_job(&harness, "job-1", "vps-a").await;
    start_job(&harness, "job-2", "vps-a").await;

    // vps-b has one spare slot; two sessions must move.
    let outcome = harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();
    match outcome {
        UpdateOutcome::Deferred { retry_after, .. } => assert_eq!(retry_after, 300),
        other => panic!("expected deferral, got {other:?}"),
    }
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.status, NodeStatus::Active);
    assert_eq!(node.current_streams, 2);
    assert!(harness.services.handover.context("vps-a").unwrap().is_none());
    assert_eq!(
        harness
            .services
            .lifecycle
            .repository()
            .active_sessions(Some("vps-a"))
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn stale_heartbeat_excludes_handover_target() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    harness.active_node("vps-b", 4, 30.0);
    start_job(&harness, "job-1", "vps-a").await;
    harness.clock.advance_secs(121);
    harness
        .services
        .registry
        .record_heartbeat("vps-a", harness.clock.now(), None)
        .unwrap();

    let target = harness
        .services
        .handover
        .find_handover_target("vps-a", 1)
        .unwrap();
    assert!(target.is_none());
}

#[tokio::test]
async fn handover_prefers_least_loaded_target() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    harness.active_node("vps-busy", 8, 30.0);
    harness.active_node("vps-idle", 4, 30.0);
    harness.services.registry.increment_load("vps-busy").unwrap();
    let target = harness
        .services
        .handover
        .find_handover_target("vps-a", 1)
        .unwrap()
        .unwrap();
    assert_eq!(target.id, "vps-idle");
}

#[tokio::test]
async fn end_to_end_placement_and_graceful_update() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 92.0);
    harness.active_node("vps-b", 4, 20.0);
    let old_session = start_job(&harness, "job-live", "vps-a").await;
    assert_eq!(harness.services.registry.load("vps-a").unwrap(), 1);

    let plan = harness
        .services
        .planner
        .distribute_stream(&PlacementRequest {
            job_id: "job-new".to_string(),
            source_url: "https://cdn.example.com/new.mp4".to_string(),
            file_size_bytes: 3 * 1024 * MB,
        })
        .await
        .unwrap();
    assert_eq!(plan.primary.node_id, "vps-b");
    assert_eq!(plan.strategy, StreamingStrategy::UrlStreaming);

    let outcome = harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::HandoverStarted {
            source: "vps-a".to_string(),
            destination: "vps-b".to_string(),
            migrated: vec!["job-live".to_string()],
            failed: Vec::new(),
        }
    );

    let repository = harness.services.lifecycle.repository();
    let job = repository.job("job-live").unwrap().unwrap();
    assert_eq!(job.node_id.as_deref(), Some("vps-b"));
    assert_eq!(job.status, JobStatus::Streaming);
    let active = repository.active_session("job-live").unwrap().unwrap();
    assert_eq!(active.node_id, "vps-b");
    assert_eq!(active.handover_from.as_deref(), Some("vps-a"));
    let old = repository.session(&old_session).unwrap().unwrap();
    assert_eq!(old.status, SessionStatus::Stopped);
    assert_eq!(old.stop_reason.as_deref(), Some("handover"));

    assert_eq!(harness.services.registry.load("vps-a").unwrap(), 0);
    assert_eq!(harness.services.registry.load("vps-b").unwrap(), 1);
    let source = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(source.status, NodeStatus::PreparingUpdate);
    let context = harness.services.handover.context("vps-a").unwrap().unwrap();
    assert_eq!(context.destination_node, "vps-b");

    // The grace-period check verifies the move and updates vps-a directly.
    let mut inbox = harness.services.agent.commands("vps-a").await.unwrap();
    harness.clock.advance_secs(60);
    let report = harness.services.supervisor.tick().await.unwrap();
    assert_eq!(report.timers_fired, 1);
    match &report.handover_checks[0].1 {
        HandoverCheck::Completed { outcome } => assert_eq!(
            outcome,
            &UpdateOutcome::Updating {
                node_id: "vps-a".to_string()
            }
        ),
        other => panic!("unexpected check result {other:?}"),
    }
    assert!(matches!(
        inbox.next().await,
        Some(AgentCommand::UpdateAgent { .. })
    ));
    assert!(harness.services.handover.context("vps-a").unwrap().is_none());
    let source = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(source.status, NodeStatus::Updating);

    let node = harness
        .services
        .handover
        .handle_update_completion("vps-a", true, None, Some("2.4.0"))
        .unwrap();
    assert_eq!(node.status, NodeStatus::Active);
    assert_eq!(node.agent_version.as_deref(), Some("2.4.0"));
    assert!(harness.services.timers.pending().unwrap().is_empty());
}

#[tokio::test]
async fn handover_start_failure_reverts_counters() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    harness.active_node("vps-b", 4, 30.0);
    let session = start_job(&harness, "job-1", "vps-a").await;
    harness.remote.fail_dispatch_on("vps-b");

    let outcome = harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Deferred { .. }));
    assert_eq!(harness.services.registry.load("vps-a").unwrap(), 1);
    assert_eq!(harness.services.registry.load("vps-b").unwrap(), 0);
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.status, NodeStatus::Active);
    let repository = harness.services.lifecycle.repository();
    assert_eq!(
        repository.active_session("job-1").unwrap().unwrap().id,
        session
    );
    let job = repository.job("job-1").unwrap().unwrap();
    assert_eq!(job.node_id.as_deref(), Some("vps-a"));
    assert_eq!(job.status, JobStatus::Streaming);
}

#[tokio::test]
async fn silent_update_marks_node_error() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    let _inbox = harness.services.agent.commands("vps-a").await.unwrap();
    harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();

    harness.clock.advance_secs(119);
    let report = harness.services.supervisor.tick().await.unwrap();
    assert_eq!(report.timers_fired, 0);

    harness.clock.advance_secs(1);
    let report = harness.services.supervisor.tick().await.unwrap();
    assert_eq!(report.nodes_marked_error, vec!["vps-a".to_string()]);
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.status, NodeStatus::Error);
    assert_eq!(
        node.error_message.as_deref(),
        Some("agent update did not report completion")
    );
}

#[tokio::test]
async fn failed_update_report_records_error() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    let node = harness
        .services
        .handover
        .handle_update_completion("vps-a", false, Some("pip install failed"), None)
        .unwrap();
    assert_eq!(node.status, NodeStatus::Error);
    assert_eq!(node.error_message.as_deref(), Some("pip install failed"));

    let node = harness
        .services
        .handover
        .handle_update_completion("vps-a", true, None, Some("2.4.1"))
        .unwrap();
    assert_eq!(node.status, NodeStatus::Active);
    assert!(node.error_message.is_none());
}

#[tokio::test]
async fn repeated_update_during_handover_is_deferred() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    harness.active_node("vps-b", 4, 30.0);
    start_job(&harness, "job-1", "vps-a").await;
    let mut inbox = harness.services.agent.commands("vps-a").await.unwrap();

    let first = harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();
    assert!(matches!(first, UpdateOutcome::HandoverStarted { .. }));
    let again = harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();
    assert!(matches!(again, UpdateOutcome::Deferred { retry_after: 300, .. }));
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.status, NodeStatus::PreparingUpdate);

    harness.clock.advance_secs(61);
    let report = harness.services.supervisor.tick().await.unwrap();
    assert!(matches!(
        report.handover_checks[0].1,
        HandoverCheck::Completed { .. }
    ));
    assert!(matches!(
        inbox.next().await,
        Some(AgentCommand::UpdateAgent { .. })
    ));
    let extra = tokio::time::timeout(std::time::Duration::from_millis(50), inbox.next()).await;
    assert!(extra.is_err(), "unexpected second command: {extra:?}");
    let completion_checks = harness
        .services
        .timers
        .pending()
        .unwrap()
        .into_iter()
        .filter(|timer| matches!(timer.kind, TimerKind::UpdateCompletionCheck { .. }))
        .count();
    assert_eq!(completion_checks, 1);
}

#[tokio::test]
async fn inactive_nodes_are_not_updated() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    let _inbox = harness.services.agent.commands("vps-a").await.unwrap();

    for status in [NodeStatus::Pending, NodeStatus::Decommissioning, NodeStatus::Updating] {
        harness.services.registry.set_status("vps-a", status).unwrap();
        let outcome = harness
            .services
            .handover
            .initiate_update("vps-a", update())
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Deferred { .. }));
        let node = harness.services.registry.require("vps-a").unwrap();
        assert_eq!(node.status, status);
    }
    assert!(harness.services.timers.pending().unwrap().is_empty());

    // A node whose last update failed may be retried.
    harness
        .services
        .handover
        .handle_update_completion("vps-a", false, Some("checksum mismatch"), None)
        .unwrap();
    let outcome = harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updating { .. }));
}

#[tokio::test]
async fn handover_check_skips_update_when_node_moved_on() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    harness.active_node("vps-b", 4, 30.0);
    start_job(&harness, "job-1", "vps-a").await;
    let mut inbox = harness.services.agent.commands("vps-a").await.unwrap();
    harness
        .services
        .handover
        .initiate_update("vps-a", update())
        .await
        .unwrap();

    harness
        .services
        .registry
        .set_status("vps-a", NodeStatus::Decommissioning)
        .unwrap();
    harness.clock.advance_secs(61);
    let report = harness.services.supervisor.tick().await.unwrap();
    assert_eq!(report.handover_checks[0].1, HandoverCheck::Expired);
    let extra = tokio::time::timeout(std::time::Duration::from_millis(50), inbox.next()).await;
    assert!(extra.is_err());
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.status, NodeStatus::Decommissioning);
    assert!(harness.services.handover.context("vps-a").unwrap().is_none());
}
