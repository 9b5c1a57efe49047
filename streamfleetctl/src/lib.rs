use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use serde_json::Value;
use streamfleet_core::{
    load_fleet_config, CircuitRecord, Clock, DistributionPlan, FleetConfig, FleetServices,
    FleetSummary, InMemoryBus, LoadAdjustment, MediaFile, Node, NodeStatus, OperationKind,
    PlacementRequest, QueueStatus, RemoteExecutor, SqliteStore, SshExecutor, SshTelemetryProbe,
    StreamJob, SystemClock, TickReport, UpdateOutcome, UpdateRequest, WorkOutcome,
};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] streamfleet_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] streamfleet_core::StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] streamfleet_core::RegistryError),
    #[error("placement failed: {0}")]
    Placement(#[from] streamfleet_core::PlacementError),
    #[error("breaker error: {0}")]
    Breaker(#[from] streamfleet_core::BreakerError),
    #[error("operation queue error: {0}")]
    Operation(#[from] streamfleet_core::OperationError),
    #[error("worker error: {0}")]
    Worker(#[from] streamfleet_core::WorkerError),
    #[error("handover error: {0}")]
    Handover(#[from] streamfleet_core::HandoverError),
    #[error("supervisor error: {0}")]
    Supervisor(#[from] streamfleet_core::SupervisorError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Streamfleet control-plane CLI", long_about = None)]
pub struct Cli {
    /// Path to fleet.toml
    #[arg(long, default_value = "configs/fleet.toml")]
    pub config: PathBuf,
    /// Override for the shared-state database (replaces store.database)
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Local auth token (required when STREAMFLEETCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Emit logs as JSON lines on stderr
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Worker node registry
    #[command(subcommand)]
    Nodes(NodesCommands),
    /// Stream jobs known to the control plane
    #[command(subcommand)]
    Jobs(JobsCommands),
    /// Compute a distribution plan without starting anything
    Place(PlaceArgs),
    /// RTMP destination circuit breakers
    #[command(subcommand)]
    Breaker(BreakerCommands),
    /// Per-job operation queues
    #[command(subcommand)]
    Ops(OpsCommands),
    /// Start a graceful agent update on a node
    Update(UpdateArgs),
    /// Record the result an agent reported for its update
    UpdateComplete(UpdateCompleteArgs),
    /// Run the supervisor loop until interrupted
    Supervise(SuperviseArgs),
    /// Recompute node load counters from active sessions
    Reconcile,
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum NodesCommands {
    /// List registered nodes and the fleet summary
    List(NodesListArgs),
    /// Register a node
    Register(NodeRegisterArgs),
    /// Set a node's status
    Status(NodeStatusArgs),
}

#[derive(Args, Debug)]
pub struct NodesListArgs {
    /// Only nodes with this status
    #[arg(long)]
    pub status: Option<NodeStatus>,
}

#[derive(Args, Debug)]
pub struct NodeRegisterArgs {
    #[arg(long)]
    pub id: String,
    #[arg(long)]
    pub host: String,
    /// Maximum concurrent streams
    #[arg(long)]
    pub capacity: u32,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long, default_value = "root")]
    pub ssh_user: String,
    #[arg(long, default_value_t = 22)]
    pub ssh_port: u16,
    /// Register directly as ACTIVE instead of PENDING
    #[arg(long, default_value_t = false)]
    pub active: bool,
}

#[derive(Args, Debug)]
pub struct NodeStatusArgs {
    pub id: String,
    pub status: NodeStatus,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// Create a stream job from a single source file
    Create(JobCreateArgs),
    /// List stream jobs
    List,
}

#[derive(Args, Debug)]
pub struct JobCreateArgs {
    #[arg(long)]
    pub id: String,
    #[arg(long)]
    pub user: String,
    #[arg(long)]
    pub title: String,
    /// Source media URL
    #[arg(long)]
    pub url: String,
    #[arg(long)]
    pub size_bytes: u64,
    /// RTMP destination (repeatable)
    #[arg(long = "destination", required = true)]
    pub destinations: Vec<String>,
    #[arg(long = "loop", default_value_t = false)]
    pub loop_enabled: bool,
}

#[derive(Args, Debug)]
pub struct PlaceArgs {
    #[arg(long)]
    pub job_id: String,
    #[arg(long)]
    pub url: String,
    #[arg(long)]
    pub size_bytes: u64,
}

#[derive(Subcommand, Debug)]
pub enum BreakerCommands {
    /// Show the stored circuit for a destination
    Status { url: String },
    /// Force a destination's circuit back to CLOSED
    Reset { url: String },
    /// TCP-probe a destination and record the result
    Probe { url: String },
}

#[derive(Subcommand, Debug)]
pub enum OpsCommands {
    /// Queue, processing marker and history for a job
    Status { job_id: String },
    /// Drop queued and processing operations for a job
    Clear { job_id: String },
    /// Submit an operation (start, stop, restart, update)
    Submit(OpsSubmitArgs),
    /// Execute the next admitted operation for a job
    Drive { job_id: String },
}

#[derive(Args, Debug)]
pub struct OpsSubmitArgs {
    pub job_id: String,
    pub kind: OperationKind,
    /// JSON payload
    #[arg(long)]
    pub payload: Option<String>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub node_id: String,
    #[arg(long)]
    pub version: String,
    /// JSON passed to the agent as update_data
    #[arg(long)]
    pub data: Option<String>,
}

#[derive(Args, Debug)]
pub struct UpdateCompleteArgs {
    pub node_id: String,
    /// Report a failed update
    #[arg(long, default_value_t = false)]
    pub failed: bool,
    #[arg(long)]
    pub message: Option<String>,
    #[arg(long)]
    pub version: Option<String>,
}

#[derive(Args, Debug)]
pub struct SuperviseArgs {
    /// Run a single tick and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }
    init_logging(cli.json_logs);

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(context.execute(&cli.command, cli.format))
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("STREAMFLEETCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A subscriber may already be installed when embedded; keep it.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

fn parse_json(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|err| AppError::InvalidArgument(format!("invalid JSON: {err}"))),
        None => Ok(Value::Null),
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    database: PathBuf,
    services: FleetServices,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_fleet_config(&cli.config)?;
        let database = cli
            .database
            .clone()
            .unwrap_or_else(|| config.resolve_path(&config.store.database));
        Self::open(&config, database)
    }

    fn open(config: &FleetConfig, database: PathBuf) -> Result<Self> {
        if let Some(parent) = database.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = SqliteStore::builder()
            .path(&database)
            .clock(clock.clone())
            .build()?;
        store.initialize()?;

        let remote: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(config.ssh.clone(), None));
        let probe = Arc::new(SshTelemetryProbe::new(remote.clone()));
        let services = FleetServices::new(
            config,
            Arc::new(store),
            remote,
            probe,
            Arc::new(InMemoryBus::default()),
            clock,
        );
        Ok(Self { database, services })
    }

    async fn execute(&self, command: &Commands, format: OutputFormat) -> Result<()> {
        match command {
            Commands::Nodes(NodesCommands::List(args)) => {
                render(&self.nodes_list(args)?, format)?;
            }
            Commands::Nodes(NodesCommands::Register(args)) => {
                render(&self.node_register(args)?, format)?;
            }
            Commands::Nodes(NodesCommands::Status(args)) => {
                let node = self.services.registry.set_status(&args.id, args.status)?;
                render(&node, format)?;
            }
            Commands::Jobs(JobsCommands::Create(args)) => {
                render(&self.job_create(args)?, format)?;
            }
            Commands::Jobs(JobsCommands::List) => {
                let jobs = JobList {
                    rows: self.services.lifecycle.repository().jobs()?,
                };
                render(&jobs, format)?;
            }
            Commands::Place(args) => {
                let plan = self
                    .services
                    .planner
                    .distribute_stream(&PlacementRequest {
                        job_id: args.job_id.clone(),
                        source_url: args.url.clone(),
                        file_size_bytes: args.size_bytes,
                    })
                    .await?;
                render(&plan, format)?;
            }
            Commands::Breaker(command) => self.breaker(command, format).await?,
            Commands::Ops(command) => self.ops(command, format).await?,
            Commands::Update(args) => {
                let request = UpdateRequest {
                    version: args.version.clone(),
                    update_data: parse_json(args.data.as_deref())?,
                };
                let outcome = self
                    .services
                    .handover
                    .initiate_update(&args.node_id, request)
                    .await?;
                render(&outcome, format)?;
            }
            Commands::UpdateComplete(args) => {
                let node = self.services.handover.handle_update_completion(
                    &args.node_id,
                    !args.failed,
                    args.message.as_deref(),
                    args.version.as_deref(),
                )?;
                render(&node, format)?;
            }
            Commands::Supervise(args) => {
                if args.once {
                    let report = self.services.supervisor.tick().await?;
                    render(&report, format)?;
                } else {
                    info!(database = %self.database.display(), "supervising fleet");
                    self.services
                        .supervisor
                        .run_loop(async {
                            let _ = tokio::signal::ctrl_c().await;
                        })
                        .await?;
                }
            }
            Commands::Reconcile => {
                let adjustments = Adjustments {
                    rows: self.services.supervisor.reconcile_loads()?,
                };
                render(&adjustments, format)?;
            }
            Commands::Completions { .. } => {}
        }
        Ok(())
    }

    fn nodes_list(&self, args: &NodesListArgs) -> Result<NodeList> {
        let registry = &self.services.registry;
        let nodes = match args.status {
            Some(status) => registry.list_by_status(status)?,
            None => registry.list()?,
        };
        Ok(NodeList {
            summary: registry.summary()?,
            nodes,
        })
    }

    fn node_register(&self, args: &NodeRegisterArgs) -> Result<Node> {
        let mut node = Node::new(args.id.clone(), args.host.clone(), args.capacity);
        if let Some(name) = &args.name {
            node.name = name.clone();
        }
        node.ssh_user = args.ssh_user.clone();
        node.ssh_port = args.ssh_port;
        if args.active {
            node.status = NodeStatus::Active;
        }
        self.services.registry.register(&node)?;
        Ok(self.services.registry.require(&node.id)?)
    }

    fn job_create(&self, args: &JobCreateArgs) -> Result<StreamJob> {
        let filename = args
            .url
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("source")
            .to_string();
        let mut job = StreamJob::new(
            args.id.clone(),
            args.user.clone(),
            args.title.clone(),
            MediaFile::new(format!("{}-source", args.id), filename, args.url.clone(), args.size_bytes),
            args.destinations.clone(),
        );
        job.loop_enabled = args.loop_enabled;
        self.services.lifecycle.repository().save_job(&job)?;
        Ok(job)
    }

    async fn breaker(&self, command: &BreakerCommands, format: OutputFormat) -> Result<()> {
        let breaker = &self.services.breaker;
        match command {
            BreakerCommands::Status { url } => {
                let available = breaker.is_available(url)?;
                let report = CircuitReport {
                    url: url.clone(),
                    available,
                    record: breaker.snapshot(url)?,
                };
                render(&report, format)
            }
            BreakerCommands::Reset { url } => {
                let existed = breaker.reset(url)?;
                render(
                    &ActionResult::new(if existed {
                        format!("circuit for {url} reset")
                    } else {
                        format!("no circuit stored for {url}")
                    }),
                    format,
                )
            }
            BreakerCommands::Probe { url } => {
                let reachable = breaker.health_check(url).await?;
                let report = CircuitReport {
                    url: url.clone(),
                    available: reachable,
                    record: breaker.snapshot(url)?,
                };
                render(&report, format)
            }
        }
    }

    async fn ops(&self, command: &OpsCommands, format: OutputFormat) -> Result<()> {
        let queue = &self.services.queue;
        match command {
            OpsCommands::Status { job_id } => render(&queue.get_status(job_id)?, format),
            OpsCommands::Clear { job_id } => {
                let removed = queue.clear_operations(job_id)?;
                render(
                    &ActionResult::new(format!("removed {removed} operation(s) for {job_id}")),
                    format,
                )
            }
            OpsCommands::Submit(args) => {
                let payload = parse_json(args.payload.as_deref())?;
                let admitted = queue.queue_operation(&args.job_id, args.kind, payload)?;
                let result = if admitted {
                    ActionResult::new(format!("{} queued for {}", args.kind, args.job_id))
                } else {
                    ActionResult::rejected(format!(
                        "{} rejected for {}: conflicting operation in flight",
                        args.kind, args.job_id
                    ))
                };
                render(&result, format)
            }
            OpsCommands::Drive { job_id } => {
                let outcome = self.services.worker.drive(job_id).await?;
                render(&DriveReport { outcome }, format)
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActionResult {
    pub accepted: bool,
    pub message: String,
}

impl ActionResult {
    fn new(message: String) -> Self {
        Self {
            accepted: true,
            message,
        }
    }

    fn rejected(message: String) -> Self {
        Self {
            accepted: false,
            message,
        }
    }
}

impl DisplayFallback for ActionResult {
    fn display(&self) -> String {
        self.message.clone()
    }
}

#[derive(Debug, Serialize)]
pub struct NodeList {
    pub summary: FleetSummary,
    pub nodes: Vec<Node>,
}

impl DisplayFallback for NodeList {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} node(s), active load {}/{}",
            self.summary.total_nodes, self.summary.active_load, self.summary.active_capacity
        )];
        for node in &self.nodes {
            lines.push(node.display());
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Node {
    fn display(&self) -> String {
        let heartbeat = self
            .last_heartbeat_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} | {} | {} | streams={}/{} | agent={} | heartbeat={}",
            self.id,
            self.host,
            self.status,
            self.current_streams,
            self.max_concurrent_streams,
            self.agent_version.as_deref().unwrap_or("-"),
            heartbeat
        )
    }
}

impl DisplayFallback for StreamJob {
    fn display(&self) -> String {
        format!(
            "{} | {} | {} | node={} | destinations={}",
            self.id,
            self.title,
            self.status,
            self.node_id.as_deref().unwrap_or("-"),
            self.destinations.len()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub rows: Vec<StreamJob>,
}

impl DisplayFallback for JobList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No jobs".to_string();
        }
        self.rows
            .iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for DistributionPlan {
    fn display(&self) -> String {
        let mut lines = vec![
            format!(
                "{}: {} (fallback {}), disk pressure {:?} at {:.1}%",
                self.job_id,
                self.strategy,
                self.fallback_strategy,
                self.disk_pressure,
                self.pressure_disk_percent
            ),
            format!(
                "  primary {} score={:.1}",
                self.primary.node_id, self.primary.score
            ),
        ];
        for backup in &self.backups {
            lines.push(format!("  backup  {} score={:.1}", backup.node_id, backup.score));
        }
        lines.push(format!(
            "  analyzed {} node(s)",
            self.estimates.analyzed_nodes
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CircuitReport {
    pub url: String,
    pub available: bool,
    pub record: Option<CircuitRecord>,
}

impl DisplayFallback for CircuitReport {
    fn display(&self) -> String {
        match &self.record {
            Some(record) => format!(
                "{} | {} | available={} | failures={} | successes={} | last error={}",
                self.url,
                record.state,
                self.available,
                record.failure_count,
                record.success_count,
                record.last_failure_reason.as_deref().unwrap_or("-")
            ),
            None => format!("{} | CLOSED | available={} | no stored state", self.url, self.available),
        }
    }
}

impl DisplayFallback for QueueStatus {
    fn display(&self) -> String {
        let mut lines = vec![format!("Job {}", self.job_id)];
        match &self.processing {
            Some(op) => lines.push(format!("  processing: {} ({})", op.kind, op.id)),
            None => lines.push("  processing: -".to_string()),
        }
        for op in &self.queued {
            let due = op
                .not_before
                .map(|at| format!(" not before {}", at.to_rfc3339()))
                .unwrap_or_default();
            lines.push(format!(
                "  queued: {} priority={} retries={}{}",
                op.kind, op.priority, op.retry_count, due
            ));
        }
        for op in &self.history {
            lines.push(format!(
                "  done: {} {:?}{}",
                op.kind,
                op.status,
                op.last_error
                    .as_deref()
                    .map(|err| format!(" ({err})"))
                    .unwrap_or_default()
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct DriveReport {
    pub outcome: Option<WorkOutcome>,
}

impl DisplayFallback for DriveReport {
    fn display(&self) -> String {
        match &self.outcome {
            None => "Nothing to run".to_string(),
            Some(outcome) if outcome.success => {
                format!("{} succeeded: {}", outcome.kind, outcome.message)
            }
            Some(outcome) => format!(
                "{} failed{}: {}",
                outcome.kind,
                if outcome.will_retry { " (will retry)" } else { "" },
                outcome.message
            ),
        }
    }
}

impl DisplayFallback for UpdateOutcome {
    fn display(&self) -> String {
        match self {
            UpdateOutcome::Updating { node_id } => format!("{node_id}: update dispatched"),
            UpdateOutcome::HandoverStarted {
                source,
                destination,
                migrated,
                failed,
            } => format!(
                "{source}: handover to {destination} started ({} moved, {} failed)",
                migrated.len(),
                failed.len()
            ),
            UpdateOutcome::Deferred {
                retry_after,
                reason,
            } => format!("deferred, retry in {retry_after}s: {reason}"),
        }
    }
}

impl DisplayFallback for TickReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("timers fired: {}", self.timers_fired)];
        for (node_id, check) in &self.handover_checks {
            lines.push(format!("  handover {node_id}: {check:?}"));
        }
        for node_id in &self.nodes_marked_error {
            lines.push(format!("  {node_id} marked ERROR"));
        }
        if let Some(adjustments) = &self.load_adjustments {
            lines.push(format!("load counters corrected: {}", adjustments.len()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct Adjustments {
    pub rows: Vec<LoadAdjustment>,
}

impl DisplayFallback for Adjustments {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Load counters match active sessions".to_string();
        }
        self.rows
            .iter()
            .map(|row| format!("{}: {} -> {}", row.node_id, row.recorded, row.actual))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
