use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{PlacementSection, PressureBasis};

use super::models::{DiskPressure, Node, NodeStatus, NodeTelemetry, StreamingStrategy};
use super::registry::{NodeRegistry, RegistryError};
use super::telemetry::TelemetryProbe;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no nodes available for placement")]
    NoNodesAvailable,
    #[error("fleet analysis failed: {0}")]
    AnalysisFailed(String),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl PlacementError {
    pub fn code(&self) -> &'static str {
        match self {
            PlacementError::NoNodesAvailable => "NO_NODES_AVAILABLE",
            PlacementError::AnalysisFailed(_) | PlacementError::Registry(_) => "ANALYSIS_FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub job_id: String,
    pub source_url: String,
    pub file_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeCandidate {
    pub node_id: String,
    pub score: f64,
    pub telemetry: NodeTelemetry,
    pub spare_capacity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanEstimates {
    /// Local disk the plan will consume on the primary node.
    pub local_disk_gb: f64,
    pub primary_available_disk_gb: f64,
    /// Relative streaming robustness, 0..=1.
    pub performance_score: f64,
    pub analyzed_nodes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionPlan {
    pub job_id: String,
    pub strategy: StreamingStrategy,
    pub fallback_strategy: StreamingStrategy,
    pub disk_pressure: DiskPressure,
    pub pressure_disk_percent: f64,
    pub primary: NodeCandidate,
    pub backups: Vec<NodeCandidate>,
    pub estimates: PlanEstimates,
    pub created_at: DateTime<Utc>,
}

impl DistributionPlan {
    /// Primary first, then backups in rank order.
    pub fn ranked_nodes(&self) -> impl Iterator<Item = &NodeCandidate> {
        std::iter::once(&self.primary).chain(self.backups.iter())
    }
}

/// `100 - disk*0.5 - cpu*0.3 - mem*0.2 + min(net/100, 20)`, never below zero.
pub fn suitability_score(telemetry: &NodeTelemetry) -> f64 {
    let score = 100.0 - telemetry.disk_percent * 0.5 - telemetry.cpu_percent * 0.3
        - telemetry.ram_percent * 0.2
        + (telemetry.network_mbps / 100.0).min(20.0);
    score.max(0.0)
}

pub fn select_strategy(
    pressure: DiskPressure,
    file_size_bytes: u64,
    config: &PlacementSection,
) -> StreamingStrategy {
    let small = config.small_file_mb * MB;
    let medium = config.medium_file_mb * MB;
    match pressure {
        DiskPressure::Critical => StreamingStrategy::UrlStreaming,
        DiskPressure::High if file_size_bytes <= small => StreamingStrategy::DownloadStreaming,
        DiskPressure::High => StreamingStrategy::UrlStreaming,
        DiskPressure::Medium if file_size_bytes <= medium => StreamingStrategy::DownloadStreaming,
        DiskPressure::Medium => StreamingStrategy::UrlStreaming,
        DiskPressure::Low => StreamingStrategy::DownloadStreaming,
    }
}

/// Sorts by score descending. The sort is stable, so equal scores keep the
/// input order.
pub fn rank_candidates(mut candidates: Vec<NodeCandidate>) -> Vec<NodeCandidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// Chooses the node and delivery strategy for a streaming job. Read-only:
/// node state is never mutated here.
pub struct PlacementPlanner {
    registry: NodeRegistry,
    probe: Arc<dyn TelemetryProbe>,
    config: PlacementSection,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PlacementPlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlacementPlanner")
            .field("config", &self.config)
            .finish()
    }
}

impl PlacementPlanner {
    pub fn new(
        registry: NodeRegistry,
        probe: Arc<dyn TelemetryProbe>,
        config: PlacementSection,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            clock,
        }
    }

    pub async fn distribute_stream(
        &self,
        request: &PlacementRequest,
    ) -> Result<DistributionPlan, PlacementError> {
        let nodes: Vec<Node> = self
            .registry
            .list_by_status(NodeStatus::Active)?
            .into_iter()
            .filter(|node| node.spare_capacity() > 0)
            .collect();
        if nodes.is_empty() {
            warn!(job_id = %request.job_id, "no active nodes with spare capacity");
            return Err(PlacementError::NoNodesAvailable);
        }

        let candidates = self.analyze(&nodes).await;
        if candidates.is_empty() {
            return Err(PlacementError::AnalysisFailed(format!(
                "telemetry unavailable for all {} active nodes",
                nodes.len()
            )));
        }

        let analyzed = candidates.len();
        let fleet_disk_average =
            candidates.iter().map(|c| c.telemetry.disk_percent).sum::<f64>() / analyzed as f64;
        let mut ranked = rank_candidates(candidates).into_iter();
        let primary = ranked
            .next()
            .ok_or_else(|| PlacementError::AnalysisFailed("empty ranking".to_string()))?;
        let backups: Vec<NodeCandidate> = ranked.take(self.config.backup_count).collect();

        let pressure_percent = match self.config.pressure_basis {
            PressureBasis::FleetAverage => fleet_disk_average,
            PressureBasis::Primary => primary.telemetry.disk_percent,
        };
        let plan = self.build_plan(request, primary, backups, pressure_percent, analyzed);
        info!(
            job_id = %plan.job_id,
            node_id = %plan.primary.node_id,
            strategy = %plan.strategy,
            pressure = ?plan.disk_pressure,
            backups = plan.backups.len(),
            "distribution plan computed"
        );
        Ok(plan)
    }

    /// Plan restricted to one node, used when a session is relocated.
    pub async fn plan_for_node(
        &self,
        node: &Node,
        request: &PlacementRequest,
    ) -> Result<DistributionPlan, PlacementError> {
        let telemetry = self
            .probe
            .probe(node)
            .await
            .map_err(|err| PlacementError::AnalysisFailed(err.to_string()))?;
        let candidate = NodeCandidate {
            node_id: node.id.clone(),
            score: suitability_score(&telemetry),
            telemetry,
            spare_capacity: node.spare_capacity(),
        };
        Ok(self.build_plan(request, candidate, Vec::new(), telemetry.disk_percent, 1))
    }

    async fn analyze(&self, nodes: &[Node]) -> Vec<NodeCandidate> {
        let probes = nodes.iter().map(|node| self.probe.probe(node));
        let results = futures::future::join_all(probes).await;
        let mut candidates = Vec::with_capacity(nodes.len());
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(telemetry) => {
                    let score = suitability_score(&telemetry);
                    debug!(node_id = %node.id, score, disk = telemetry.disk_percent, "node analyzed");
                    candidates.push(NodeCandidate {
                        node_id: node.id.clone(),
                        score,
                        telemetry,
                        spare_capacity: node.spare_capacity(),
                    });
                }
                Err(error) => {
                    warn!(node_id = %node.id, %error, "telemetry probe failed, skipping node");
                }
            }
        }
        candidates
    }

    fn build_plan(
        &self,
        request: &PlacementRequest,
        primary: NodeCandidate,
        backups: Vec<NodeCandidate>,
        pressure_percent: f64,
        analyzed_nodes: usize,
    ) -> DistributionPlan {
        let disk_pressure = DiskPressure::from_percent(pressure_percent);
        let strategy = select_strategy(disk_pressure, request.file_size_bytes, &self.config);
        let local_disk_gb = match strategy {
            StreamingStrategy::DownloadStreaming => {
                request.file_size_bytes as f64 / (1024.0 * MB as f64)
            }
            StreamingStrategy::UrlStreaming => 0.0,
        };
        let performance_score = match strategy {
            StreamingStrategy::DownloadStreaming => 0.9,
            StreamingStrategy::UrlStreaming => 0.7,
        } * (primary.score / 100.0).clamp(0.0, 1.2);
        DistributionPlan {
            job_id: request.job_id.clone(),
            strategy,
            fallback_strategy: StreamingStrategy::UrlStreaming,
            disk_pressure,
            pressure_disk_percent: pressure_percent,
            estimates: PlanEstimates {
                local_disk_gb,
                primary_available_disk_gb: primary.telemetry.available_disk_gb,
                performance_score: performance_score.min(1.0),
                analyzed_nodes,
            },
            primary,
            backups,
            created_at: self.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(disk: f64, cpu: f64, ram: f64, net: f64) -> NodeTelemetry {
        NodeTelemetry {
            cpu_percent: cpu,
            ram_percent: ram,
            disk_percent: disk,
            available_disk_gb: 100.0,
            network_mbps: net,
        }
    }

    #[test]
    fn score_formula_and_network_cap() {
        let t = telemetry(20.0, 10.0, 50.0, 1000.0);
        assert!((suitability_score(&t) - (100.0 - 10.0 - 3.0 - 10.0 + 10.0)).abs() < 1e-9);
        let fast = telemetry(0.0, 0.0, 0.0, 10_000.0);
        assert!((suitability_score(&fast) - 120.0).abs() < 1e-9);
        let saturated = telemetry(100.0, 100.0, 100.0, 0.0);
        assert_eq!(suitability_score(&saturated), 0.0);
    }

    #[test]
    fn decision_matrix_matches_table() {
        let config = PlacementSection::default();
        let sizes = [100 * MB, 1024 * MB, 4096 * MB];
        let expectations = [
            (10.0, [true, true, true]),
            (60.0, [true, true, false]),
            (80.0, [true, false, false]),
            (95.0, [false, false, false]),
        ];
        for (disk, downloads) in expectations {
            let pressure = DiskPressure::from_percent(disk);
            for (size, download) in sizes.iter().zip(downloads) {
                let expected = if download {
                    StreamingStrategy::DownloadStreaming
                } else {
                    StreamingStrategy::UrlStreaming
                };
                assert_eq!(
                    select_strategy(pressure, *size, &config),
                    expected,
                    "disk={disk} size={size}"
                );
            }
        }
    }

    #[test]
    fn threshold_sizes_are_inclusive() {
        let config = PlacementSection::default();
        assert_eq!(
            select_strategy(DiskPressure::High, 500 * MB, &config),
            StreamingStrategy::DownloadStreaming
        );
        assert_eq!(
            select_strategy(DiskPressure::Medium, 2048 * MB + 1, &config),
            StreamingStrategy::UrlStreaming
        );
    }

    #[test]
    fn ranking_is_stable_on_ties() {
        let make = |id: &str, score: f64| NodeCandidate {
            node_id: id.to_string(),
            score,
            telemetry: telemetry(0.0, 0.0, 0.0, 0.0),
            spare_capacity: 1,
        };
        let ranked = rank_candidates(vec![
            make("a", 50.0),
            make("b", 70.0),
            make("c", 50.0),
            make("d", 70.0),
        ]);
        let order: Vec<&str> = ranked.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }
}
