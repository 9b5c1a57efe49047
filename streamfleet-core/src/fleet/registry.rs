use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::store::{get_record, put_record, SharedStore, StoreError};

use super::models::{FleetSummary, Node, NodeStatus};

const NODE_INDEX_KEY: &str = "vps_nodes";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("node {0} not found")]
    NotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

fn node_key(id: &str) -> String {
    format!("vps_node:{id}")
}

fn load_key(id: &str) -> String {
    format!("vps_load:{id}")
}

/// Node records and their load counters in the shared store.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry").finish_non_exhaustive()
    }
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn register(&self, node: &Node) -> RegistryResult<()> {
        let mut record = node.clone();
        record.updated_at = self.clock.now();
        put_record(self.store.as_ref(), &node_key(&node.id), &record, None)?;
        self.store
            .set(&load_key(&node.id), &node.current_streams.max(0).to_string(), None)?;
        self.store.zadd(
            NODE_INDEX_KEY,
            &node.id,
            node.created_at.timestamp_millis() as f64,
        )?;
        info!(node_id = %node.id, status = %node.status, "node registered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> RegistryResult<Option<Node>> {
        let Some(mut node) = get_record::<Node>(self.store.as_ref(), &node_key(id))? else {
            return Ok(None);
        };
        node.current_streams = self.load(id)?;
        Ok(Some(node))
    }

    pub fn require(&self, id: &str) -> RegistryResult<Node> {
        self.get(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Every registered node in registration order.
    pub fn list(&self) -> RegistryResult<Vec<Node>> {
        let ids = self.store.zrange_by_score(NODE_INDEX_KEY, f64::MAX)?;
        let mut nodes = Vec::with_capacity(ids.len());
        for (id, _) in ids {
            if let Some(node) = self.get(&id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub fn list_by_status(&self, status: NodeStatus) -> RegistryResult<Vec<Node>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|node| node.status == status)
            .collect())
    }

    pub fn remove(&self, id: &str) -> RegistryResult<bool> {
        let removed = self.store.delete(&node_key(id))?;
        self.store.delete(&load_key(id))?;
        self.store.zrem(NODE_INDEX_KEY, id)?;
        Ok(removed)
    }

    pub fn set_status(&self, id: &str, status: NodeStatus) -> RegistryResult<Node> {
        self.modify(id, |node| node.status = status)
    }

    /// Back to ACTIVE after a successful update: error cleared, heartbeat refreshed.
    pub fn mark_active(&self, id: &str, agent_version: Option<&str>) -> RegistryResult<Node> {
        let now = self.clock.now();
        self.modify(id, |node| {
            node.status = NodeStatus::Active;
            node.error_message = None;
            node.last_heartbeat_at = Some(now);
            if let Some(version) = agent_version {
                node.agent_version = Some(version.to_string());
            }
        })
    }

    pub fn mark_error(&self, id: &str, message: &str) -> RegistryResult<Node> {
        self.modify(id, |node| {
            node.status = NodeStatus::Error;
            node.error_message = Some(message.to_string());
        })
    }

    pub fn record_heartbeat(
        &self,
        id: &str,
        at: DateTime<Utc>,
        agent_version: Option<&str>,
    ) -> RegistryResult<Node> {
        self.modify(id, |node| {
            node.last_heartbeat_at = Some(at);
            if let Some(version) = agent_version {
                node.agent_version = Some(version.to_string());
            }
        })
    }

    pub fn load(&self, id: &str) -> RegistryResult<i64> {
        Ok(self
            .store
            .get(&load_key(id))?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0))
    }

    pub fn increment_load(&self, id: &str) -> RegistryResult<i64> {
        Ok(self.store.incr_by(&load_key(id), 1)?)
    }

    pub fn decrement_load(&self, id: &str) -> RegistryResult<i64> {
        let value = self.store.incr_by(&load_key(id), -1)?;
        if value < 0 {
            warn!(node_id = %id, value, "load counter went negative, clamping to zero");
            self.store.set(&load_key(id), "0", None)?;
            return Ok(0);
        }
        Ok(value)
    }

    pub fn set_load(&self, id: &str, value: i64) -> RegistryResult<()> {
        self.store
            .set(&load_key(id), &value.max(0).to_string(), None)?;
        Ok(())
    }

    pub fn summary(&self) -> RegistryResult<FleetSummary> {
        let nodes = self.list()?;
        let mut summary = FleetSummary {
            total_nodes: nodes.len(),
            ..FleetSummary::default()
        };
        for node in &nodes {
            *summary
                .by_status
                .entry(node.status.as_str().to_string())
                .or_insert(0) += 1;
            if node.status == NodeStatus::Active {
                summary.active_capacity += node.max_concurrent_streams as i64;
                summary.active_load += node.current_streams;
            }
        }
        Ok(summary)
    }

    fn modify<F>(&self, id: &str, mutate: F) -> RegistryResult<Node>
    where
        F: FnOnce(&mut Node),
    {
        let key = node_key(id);
        let mut node = get_record::<Node>(self.store.as_ref(), &key)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        mutate(&mut node);
        node.updated_at = self.clock.now();
        put_record(self.store.as_ref(), &key, &node, None)?;
        node.current_streams = self.load(id)?;
        Ok(node)
    }
}
