#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use streamfleet_core::fleet::TelemetryError;
use streamfleet_core::{
    Clock, CommandOutput, FleetConfig, FleetServices, InMemoryBus, ManualClock, MediaFile,
    MemoryStore, Node, NodeStatus, NodeTelemetry, RemoteError, RemoteExecutor, StreamJob,
    TelemetryProbe,
};

pub const MB: u64 = 1024 * 1024;

/// Remote executor that pretends to be a fleet of shells. Downloads create
/// files, dispatches print a PID, and stat/rm consume files.
#[derive(Default)]
pub struct ScriptedRemote {
    pub commands: Mutex<Vec<(String, String)>>,
    files: Mutex<HashSet<(String, String)>>,
    fail_downloads: Mutex<HashSet<String>>,
    fail_dispatch: Mutex<HashSet<String>>,
    next_pid: Mutex<u32>,
}

fn quoted_after<'a>(command: &'a str, marker: &str) -> Option<&'a str> {
    let start = command.find(marker)? + marker.len();
    let rest = &command[start..];
    let end = rest.find('\'')?;
    Some(&rest[..end])
}

impl ScriptedRemote {
    pub fn fail_downloads_on(&self, node_id: &str) {
        self.fail_downloads.lock().unwrap().insert(node_id.to_string());
    }

    pub fn fail_dispatch_on(&self, node_id: &str) {
        self.fail_dispatch.lock().unwrap().insert(node_id.to_string());
    }

    pub fn has_file(&self, node_id: &str, path: &str) -> bool {
        self.files
            .lock()
            .unwrap()
            .contains(&(node_id.to_string(), path.to_string()))
    }

    pub fn commands_for(&self, node_id: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(node, _)| node == node_id)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, command)| command.contains(needle))
            .count()
    }

    fn respond(&self, node: &Node, command: &str) -> CommandOutput {
        let ok = |stdout: String| CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
        };
        let fail = |stderr: &str| CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
        };
        if command.contains("curl ") {
            if self.fail_downloads.lock().unwrap().contains(&node.id) {
                return fail("curl: (22) The requested URL returned error: 403");
            }
            if let Some(path) = quoted_after(command, "-o '") {
                self.files
                    .lock()
                    .unwrap()
                    .insert((node.id.clone(), path.to_string()));
            }
            return ok(String::new());
        }
        if command.contains("echo $!") {
            if self.fail_dispatch.lock().unwrap().contains(&node.id) {
                return fail("ffmpeg: not found");
            }
            let mut pid = self.next_pid.lock().unwrap();
            *pid += 1;
            return ok(format!("{}\n", 4000 + *pid));
        }
        if command.starts_with("if [ -f ") {
            let Some(path) = quoted_after(command, "[ -f '") else {
                return ok("missing\n".to_string());
            };
            let removed = self
                .files
                .lock()
                .unwrap()
                .remove(&(node.id.clone(), path.to_string()));
            return if removed {
                ok("3221225472\n".to_string())
            } else {
                ok("missing\n".to_string())
            };
        }
        if command.starts_with("rm -f ") {
            if let Some(path) = quoted_after(command, "rm -f '") {
                self.files
                    .lock()
                    .unwrap()
                    .remove(&(node.id.clone(), path.to_string()));
            }
            return ok(String::new());
        }
        if command.starts_with("kill -TERM") {
            return ok("terminated\n".to_string());
        }
        ok(String::new())
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedRemote {
    async fn execute(&self, node: &Node, command: &str) -> Result<CommandOutput, RemoteError> {
        self.commands
            .lock()
            .unwrap()
            .push((node.id.clone(), command.to_string()));
        Ok(self.respond(node, command))
    }

    async fn upload_file(&self, _node: &Node, _local: &Path, _remote: &str) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Telemetry keyed by node id; unknown nodes fail to probe.
#[derive(Default)]
pub struct StaticProbe {
    readings: Mutex<HashMap<String, NodeTelemetry>>,
}

impl StaticProbe {
    pub fn set(&self, node_id: &str, telemetry: NodeTelemetry) {
        self.readings
            .lock()
            .unwrap()
            .insert(node_id.to_string(), telemetry);
    }

    pub fn set_disk(&self, node_id: &str, disk_percent: f64) {
        self.set(node_id, telemetry(disk_percent));
    }
}

#[async_trait]
impl TelemetryProbe for StaticProbe {
    async fn probe(&self, node: &Node) -> Result<NodeTelemetry, TelemetryError> {
        self.readings
            .lock()
            .unwrap()
            .get(&node.id)
            .copied()
            .ok_or(TelemetryError::MissingField("disk_percent"))
    }
}

pub fn telemetry(disk_percent: f64) -> NodeTelemetry {
    NodeTelemetry {
        cpu_percent: 10.0,
        ram_percent: 30.0,
        disk_percent,
        available_disk_gb: 200.0 * (100.0 - disk_percent) / 100.0,
        network_mbps: 1000.0,
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub bus: Arc<InMemoryBus>,
    pub remote: Arc<ScriptedRemote>,
    pub probe: Arc<StaticProbe>,
    pub services: FleetServices,
    pub config: FleetConfig,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = FleetConfig::default();
        config.handover.stagger_millis = 0;
        config.lifecycle.kill_grace_seconds = 0;
        Self::with_config(config)
    }

    pub fn with_config(config: FleetConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let bus = Arc::new(InMemoryBus::default());
        let remote = Arc::new(ScriptedRemote::default());
        let probe = Arc::new(StaticProbe::default());
        let services = FleetServices::new(
            &config,
            store.clone(),
            remote.clone(),
            probe.clone(),
            bus.clone(),
            clock.clone(),
        );
        Self {
            clock,
            store,
            bus,
            remote,
            probe,
            services,
            config,
        }
    }

    /// Registers an ACTIVE node with a fresh heartbeat and the given disk usage.
    pub fn active_node(&self, id: &str, capacity: u32, disk_percent: f64) -> Node {
        let mut node = Node::new(id, format!("10.0.0.{}", id.len()), capacity);
        node.status = NodeStatus::Active;
        node.last_heartbeat_at = Some(self.clock.now());
        self.services.registry.register(&node).unwrap();
        self.probe.set_disk(id, disk_percent);
        self.services.registry.require(id).unwrap()
    }

    pub fn job(&self, id: &str, size_bytes: u64) -> StreamJob {
        let job = StreamJob::new(
            id,
            "user-1",
            format!("Stream {id}"),
            MediaFile::new(
                format!("file-{id}"),
                "show.mp4",
                format!("https://cdn.example.com/{id}/show.mp4"),
                size_bytes,
            ),
            vec![format!("rtmp://live.example.com/app/{id}")],
        );
        self.services.lifecycle.repository().save_job(&job).unwrap();
        job
    }
}
