mod common;

use common::Harness;
use streamfleet_core::{Clock, Heartbeat, LoadAdjustment, StartKind, StreamingStrategy};

async fn start(harness: &Harness, job_id: &str, node_id: &str) {
    let job = harness.job(job_id, 1024);
    let node = harness.services.registry.require(node_id).unwrap();
    harness
        .services
        .lifecycle
        .start_on_node(&job, &node, StreamingStrategy::UrlStreaming, StartKind::Fresh)
        .await
        .unwrap();
}

#[tokio::test]
async fn reconciliation_corrects_drifted_counters() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    harness.active_node("vps-b", 4, 30.0);
    start(&harness, "job-1", "vps-a").await;
    start(&harness, "job-2", "vps-a").await;

    harness.services.registry.set_load("vps-a", 5).unwrap();
    harness.services.registry.increment_load("vps-b").unwrap();

    let adjustments = harness.services.supervisor.reconcile_loads().unwrap();
    assert_eq!(
        adjustments,
        vec![
            LoadAdjustment {
                node_id: "vps-a".to_string(),
                recorded: 5,
                actual: 2,
            },
            LoadAdjustment {
                node_id: "vps-b".to_string(),
                recorded: 1,
                actual: 0,
            },
        ]
    );
    assert_eq!(harness.services.registry.load("vps-a").unwrap(), 2);
    assert_eq!(harness.services.registry.load("vps-b").unwrap(), 0);
    assert!(harness.services.supervisor.reconcile_loads().unwrap().is_empty());
}

#[tokio::test]
async fn reconciliation_runs_once_per_interval() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);

    let first = harness.services.supervisor.tick().await.unwrap();
    assert_eq!(first.load_adjustments, Some(Vec::new()));
    let second = harness.services.supervisor.tick().await.unwrap();
    assert_eq!(second.load_adjustments, None);

    harness.services.registry.set_load("vps-a", 3).unwrap();
    harness.clock.advance_secs(600);
    let third = harness.services.supervisor.tick().await.unwrap();
    assert_eq!(third.load_adjustments.map(|list| list.len()), Some(1));
    assert_eq!(harness.services.registry.load("vps-a").unwrap(), 0);
}

#[tokio::test]
async fn heartbeats_refresh_known_nodes_only() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    harness.clock.advance_secs(90);
    let now = harness.clock.now();

    let accepted = harness
        .services
        .supervisor
        .ingest_heartbeat(&Heartbeat {
            vps_id: "vps-a".to_string(),
            timestamp: now,
            active_streams: Vec::new(),
            agent_version: Some("2.3.1".to_string()),
            capabilities: vec!["ffmpeg".to_string()],
        })
        .unwrap();
    assert!(accepted);
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.last_heartbeat_at, Some(now));
    assert_eq!(node.agent_version.as_deref(), Some("2.3.1"));

    let unknown = harness
        .services
        .supervisor
        .ingest_heartbeat(&Heartbeat {
            vps_id: "vps-ghost".to_string(),
            timestamp: now,
            active_streams: Vec::new(),
            agent_version: None,
            capabilities: Vec::new(),
        })
        .unwrap();
    assert!(!unknown);
}

#[tokio::test]
async fn run_loop_ingests_published_heartbeats() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 30.0);
    let beat_at = harness.clock.now() + chrono::Duration::seconds(30);

    let supervisor = harness.services.supervisor.clone();
    let agent = harness.services.agent.clone();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        supervisor
            .run_loop(async {
                let _ = stop_rx.await;
            })
            .await
    });

    // Give the loop a chance to subscribe before publishing.
    let mut delivered = 0;
    for _ in 0..50 {
        tokio::task::yield_now().await;
        delivered = agent
            .publish_heartbeat(&Heartbeat {
                vps_id: "vps-a".to_string(),
                timestamp: beat_at,
                active_streams: Vec::new(),
                agent_version: None,
                capabilities: Vec::new(),
            })
            .await
            .unwrap();
        if delivered > 0 {
            break;
        }
    }
    assert!(delivered > 0);
    for _ in 0..50 {
        tokio::task::yield_now().await;
        let node = harness.services.registry.require("vps-a").unwrap();
        if node.last_heartbeat_at == Some(beat_at) {
            break;
        }
    }
    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
    let node = harness.services.registry.require("vps-a").unwrap();
    assert_eq!(node.last_heartbeat_at, Some(beat_at));
}
