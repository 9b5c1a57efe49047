mod common;

use common::{telemetry, Harness, MB};
use streamfleet_core::config::PressureBasis;
use streamfleet_core::{
    DiskPressure, FleetConfig, NodeStatus, PlacementError, PlacementRequest, StreamingStrategy,
};

fn request(size_bytes: u64) -> PlacementRequest {
    PlacementRequest {
        job_id: "job-1".to_string(),
        source_url: "https://cdn.example.com/show.mp4".to_string(),
        file_size_bytes: size_bytes,
    }
}

#[tokio::test]
async fn decision_matrix_over_disk_and_size() {
    use StreamingStrategy::{DownloadStreaming as D, UrlStreaming as U};
    let cases = [
        (10.0, [D, D, D]),
        (60.0, [D, D, U]),
        (80.0, [D, U, U]),
        (95.0, [U, U, U]),
    ];
    let sizes = [100 * MB, 1024 * MB, 4096 * MB];
    for (disk, expected) in cases {
        let harness = Harness::new();
        harness.active_node("vps-1", 4, disk);
        for (size, strategy) in sizes.iter().zip(expected) {
            let plan = harness
                .services
                .planner
                .distribute_stream(&request(*size))
                .await
                .unwrap();
            assert_eq!(plan.strategy, strategy, "disk={disk}% size={}MB", size / MB);
            assert_eq!(plan.fallback_strategy, StreamingStrategy::UrlStreaming);
        }
    }
}

#[tokio::test]
async fn ranking_is_deterministic_with_stable_ties() {
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 40.0);
    harness.active_node("vps-b", 4, 20.0);
    harness.active_node("vps-c", 4, 40.0);
    harness.active_node("vps-d", 4, 40.0);

    let mut orders = Vec::new();
    for _ in 0..3 {
        let plan = harness
            .services
            .planner
            .distribute_stream(&request(100 * MB))
            .await
            .unwrap();
        let order: Vec<String> = plan.ranked_nodes().map(|c| c.node_id.clone()).collect();
        orders.push(order);
    }
    assert_eq!(orders[0], vec!["vps-b", "vps-a", "vps-c"]);
    assert!(orders.iter().all(|order| order == &orders[0]));
}

#[tokio::test]
async fn only_active_nodes_with_capacity_are_candidates() {
    let harness = Harness::new();
    harness.active_node("vps-full", 1, 5.0);
    harness.services.registry.increment_load("vps-full").unwrap();
    harness.active_node("vps-updating", 4, 5.0);
    harness
        .services
        .registry
        .set_status("vps-updating", NodeStatus::Updating)
        .unwrap();
    harness.active_node("vps-ok", 4, 70.0);

    let plan = harness
        .services
        .planner
        .distribute_stream(&request(100 * MB))
        .await
        .unwrap();
    assert_eq!(plan.primary.node_id, "vps-ok");
    assert!(plan.backups.is_empty());
    assert_eq!(plan.estimates.analyzed_nodes, 1);
}

#[tokio::test]
async fn empty_fleet_reports_no_nodes() {
    let harness = Harness::new();
    let err = harness
        .services
        .planner
        .distribute_stream(&request(100 * MB))
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::NoNodesAvailable));
    assert_eq!(err.code(), "NO_NODES_AVAILABLE");
}

#[tokio::test]
async fn unreachable_fleet_reports_analysis_failure() {
    let harness = Harness::new();
    let node = harness.active_node("vps-1", 4, 10.0);
    let fresh = common::StaticProbe::default();
    let planner = streamfleet_core::PlacementPlanner::new(
        harness.services.registry.clone(),
        std::sync::Arc::new(fresh),
        Default::default(),
        harness.clock.clone(),
    );
    let err = planner.distribute_stream(&request(MB)).await.unwrap_err();
    assert_eq!(err.code(), "ANALYSIS_FAILED");
    assert_eq!(node.status, NodeStatus::Active);
}

#[tokio::test]
async fn probe_failures_skip_the_node() {
    let harness = Harness::new();
    harness.active_node("vps-1", 4, 10.0);
    harness.active_node("vps-2", 4, 30.0);
    let probe = std::sync::Arc::new(common::StaticProbe::default());
    probe.set("vps-2", telemetry(30.0));
    let planner = streamfleet_core::PlacementPlanner::new(
        harness.services.registry.clone(),
        probe,
        Default::default(),
        harness.clock.clone(),
    );
    let plan = planner.distribute_stream(&request(MB)).await.unwrap();
    assert_eq!(plan.primary.node_id, "vps-2");
}

#[tokio::test]
async fn pressure_basis_selects_disk_reading() {
    // Fleet average (92 + 20) / 2 = 56% is MEDIUM: a 3GB file streams from the URL.
    let harness = Harness::new();
    harness.active_node("vps-a", 4, 92.0);
    harness.active_node("vps-b", 4, 20.0);
    let plan = harness
        .services
        .planner
        .distribute_stream(&request(3 * 1024 * MB))
        .await
        .unwrap();
    assert_eq!(plan.primary.node_id, "vps-b");
    assert_eq!(plan.disk_pressure, DiskPressure::Medium);
    assert_eq!(plan.strategy, StreamingStrategy::UrlStreaming);
    assert_eq!(plan.estimates.local_disk_gb, 0.0);

    let mut config = FleetConfig::default();
    config.placement.pressure_basis = PressureBasis::Primary;
    let harness = Harness::with_config(config);
    harness.active_node("vps-a", 4, 92.0);
    harness.active_node("vps-b", 4, 20.0);
    let plan = harness
        .services
        .planner
        .distribute_stream(&request(3 * 1024 * MB))
        .await
        .unwrap();
    assert_eq!(plan.disk_pressure, DiskPressure::Low);
    assert_eq!(plan.strategy, StreamingStrategy::DownloadStreaming);
    assert!((plan.estimates.local_disk_gb - 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn planning_does_not_mutate_nodes() {
    let harness = Harness::new();
    let before = harness.active_node("vps-1", 4, 10.0);
    harness
        .services
        .planner
        .distribute_stream(&request(MB))
        .await
        .unwrap();
    let after = harness.services.registry.require("vps-1").unwrap();
    assert_eq!(before, after);
}
