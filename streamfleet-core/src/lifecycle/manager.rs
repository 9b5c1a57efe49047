use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerError, RtmpCircuitBreaker};
use crate::clock::Clock;
use crate::config::LifecycleSection;
use crate::fleet::{DistributionPlan, Node, NodeRegistry, RegistryError, StreamingStrategy};
use crate::remote::{shell_quote, RemoteExecutor};
use crate::store::StoreError;

use super::models::{
    CleanupSummary, JobStatus, SessionStatus, StartKind, StartReport, StopKind, StreamJob,
    StreamSession,
};
use super::store::LifecycleRepository;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),
    #[error("stream job {0} not found")]
    JobNotFound(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {0} has not finished starting")]
    SessionNotActive(String),
    #[error("every destination of job {0} is blocked by an open circuit")]
    NoDestinations(String),
    #[error("start on node {node_id} failed: {reason}")]
    StartFailed { node_id: String, reason: String },
    #[error("job {job_id} could not start on any planned node ({attempts})")]
    AllNodesFailed { job_id: String, attempts: String },
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            LifecycleError::SessionNotActive(_) => "SESSION_NOT_ACTIVE",
            LifecycleError::JobNotFound(_) => "JOB_NOT_FOUND",
            LifecycleError::NoDestinations(_) => "NO_DESTINATIONS",
            LifecycleError::StartFailed { .. } | LifecycleError::AllNodesFailed { .. } => {
                "START_FAILED"
            }
            LifecycleError::Store(_) | LifecycleError::Registry(_) | LifecycleError::Breaker(_) => {
                "INTERNAL"
            }
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Marker embedded in every worker process command line so stray processes
/// can be found without a PID.
pub fn job_marker(job_id: &str) -> String {
    format!("streamfleet_job_{job_id}")
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "source.bin".to_string()
    } else {
        cleaned
    }
}

/// Builds the backgrounded FFmpeg invocation; the command prints the PID.
pub fn build_stream_command(
    config: &LifecycleSection,
    job: &StreamJob,
    session_id: &str,
    input: &str,
    destinations: &[String],
) -> String {
    let mut args: Vec<String> = vec![
        shell_quote(&config.ffmpeg_path),
        "-hide_banner".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        "warning".into(),
        "-re".into(),
    ];
    if job.loop_enabled {
        args.extend(["-stream_loop".into(), "-1".into()]);
    }
    args.extend(["-i".into(), shell_quote(input)]);
    if config.video_codec == "copy" {
        args.extend(["-c".into(), "copy".into()]);
    } else {
        args.extend([
            "-c:v".into(),
            shell_quote(&config.video_codec),
            "-preset".into(),
            shell_quote(&config.video_preset),
            "-b:v".into(),
            shell_quote(&config.video_bitrate),
            "-g".into(),
            config.keyframe_interval.to_string(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            shell_quote(&config.audio_bitrate),
        ]);
    }
    args.extend([
        "-metadata".into(),
        shell_quote(&format!("comment={}", job_marker(&job.id))),
    ]);
    match destinations {
        [single] => args.extend(["-f".into(), "flv".into(), shell_quote(single)]),
        many => {
            let outputs = many
                .iter()
                .map(|url| format!("[f=flv:onfail=ignore]{url}"))
                .collect::<Vec<_>>()
                .join("|");
            args.extend([
                "-map".into(),
                "0".into(),
                "-f".into(),
                "tee".into(),
                shell_quote(&outputs),
            ]);
        }
    }
    let log_dir = shell_quote(&config.log_dir);
    let log_file = shell_quote(&format!("{}/{}.log", config.log_dir, session_id));
    format!(
        "mkdir -p {log_dir} && nohup {} > {log_file} 2>&1 < /dev/null & echo $!",
        args.join(" ")
    )
}

/// Turns distribution plans into worker processes on nodes and tears them
/// down again.
pub struct StreamLifecycleManager {
    repository: LifecycleRepository,
    registry: NodeRegistry,
    breaker: RtmpCircuitBreaker,
    remote: Arc<dyn RemoteExecutor>,
    clock: Arc<dyn Clock>,
    config: LifecycleSection,
}

impl fmt::Debug for StreamLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLifecycleManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StreamLifecycleManager {
    pub fn new(
        repository: LifecycleRepository,
        registry: NodeRegistry,
        breaker: RtmpCircuitBreaker,
        remote: Arc<dyn RemoteExecutor>,
        clock: Arc<dyn Clock>,
        config: LifecycleSection,
    ) -> Self {
        Self {
            repository,
            registry,
            breaker,
            remote,
            clock,
            config,
        }
    }

    pub fn repository(&self) -> &LifecycleRepository {
        &self.repository
    }

    /// Starts `job_id` on the plan's primary node, falling through to the
    /// backups in rank order when a node refuses the worker.
    pub async fn start_stream(
        &self,
        job_id: &str,
        plan: &DistributionPlan,
    ) -> LifecycleResult<StartReport> {
        let mut job = self
            .repository
            .job(job_id)?
            .ok_or_else(|| LifecycleError::JobNotFound(job_id.to_string()))?;
        if let Some(active) = self.repository.active_session(job_id)? {
            info!(job_id = %job_id, session_id = %active.id, "job already streaming, start is a no-op");
            return Ok(StartReport {
                session_id: active.id,
                job_id: job_id.to_string(),
                node_id: active.node_id,
                strategy: active.strategy,
                fell_back: active.fell_back,
                blocked_destinations: Vec::new(),
                already_active: true,
            });
        }

        let mut attempts = Vec::new();
        for candidate in plan.ranked_nodes() {
            let Some(node) = self.registry.get(&candidate.node_id)? else {
                warn!(node_id = %candidate.node_id, "planned node vanished from registry");
                continue;
            };
            match self
                .start_on_node(&job, &node, plan.strategy, StartKind::Fresh)
                .await
            {
                Ok(report) => return Ok(report),
                Err(LifecycleError::StartFailed { node_id, reason }) => {
                    warn!(job_id = %job_id, node_id = %node_id, %reason, "start failed, trying next node");
                    attempts.push(format!("{node_id}: {reason}"));
                }
                Err(other) => return Err(other),
            }
        }

        let attempts = if attempts.is_empty() {
            "no planned node available".to_string()
        } else {
            attempts.join("; ")
        };
        if let Some(latest) = self.repository.job(job_id)? {
            job = latest;
        }
        job.status = JobStatus::Failed;
        job.last_error = Some(attempts.clone());
        job.updated_at = self.clock.now();
        self.repository.save_job(&job)?;
        error!(job_id = %job_id, %attempts, "job failed on every planned node");
        Err(LifecycleError::AllNodesFailed {
            job_id: job_id.to_string(),
            attempts,
        })
    }

    /// Start protocol against a single node. Failures of the node itself
    /// surface as [`LifecycleError::StartFailed`]; the session is left FAILED
    /// and the node load counter untouched. Dispatch outcomes are fed back
    /// into the circuit breaker for every destination used.
    pub async fn start_on_node(
        &self,
        job: &StreamJob,
        node: &Node,
        strategy: StreamingStrategy,
        kind: StartKind,
    ) -> LifecycleResult<StartReport> {
        let (destinations, blocked) = self.breaker.partition_available(&job.destinations)?;
        if destinations.is_empty() {
            warn!(job_id = %job.id, blocked = blocked.len(), "all destinations blocked");
            return Err(LifecycleError::NoDestinations(job.id.clone()));
        }
        if !blocked.is_empty() {
            warn!(job_id = %job.id, blocked = ?blocked, "skipping destinations with open circuits");
        }

        let now = self.clock.now();
        let mut session = StreamSession {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            node_id: node.id.clone(),
            strategy,
            status: SessionStatus::Initializing,
            pid: None,
            local_path: None,
            command: None,
            destinations: destinations.clone(),
            fell_back: false,
            handover_from: match &kind {
                StartKind::Handover { from_node } => Some(from_node.clone()),
                StartKind::Fresh => None,
            },
            created_at: now,
            started_at: None,
            stopped_at: None,
            stop_reason: None,
            failure_reason: None,
        };
        self.repository.save_session(&session)?;

        let mut job = job.clone();
        job.status = JobStatus::Starting;
        job.node_id = Some(node.id.clone());
        job.updated_at = now;
        self.repository.save_job(&job)?;

        let mut input = job.source.url.clone();
        if strategy == StreamingStrategy::DownloadStreaming {
            match self.download_source(&job, &session, node).await {
                Ok(path) => {
                    input = path.clone();
                    session.local_path = Some(path);
                    job.source.downloaded_to_node = Some(node.id.clone());
                }
                Err(reason) => {
                    warn!(
                        job_id = %job.id,
                        node_id = %node.id,
                        %reason,
                        "download failed, falling back to url streaming"
                    );
                    session.strategy = StreamingStrategy::UrlStreaming;
                    session.fell_back = true;
                }
            }
        }

        let command = build_stream_command(&self.config, &job, &session.id, &input, &destinations);
        let pid = match self.remote.execute_checked(node, &command).await {
            Ok(output) => output.last_line().and_then(|line| line.parse::<u32>().ok()),
            Err(err) => {
                let reason = format!("dispatch failed: {err}");
                self.record_destination_failures(&destinations, &reason);
                return Err(self.fail_start(&mut job, &mut session, node, reason).await?);
            }
        };
        let Some(pid) = pid else {
            return Err(self
                .fail_start(&mut job, &mut session, node, "worker did not report a pid".into())
                .await?);
        };

        session.status = SessionStatus::Active;
        session.pid = Some(pid);
        session.command = Some(command);
        session.started_at = Some(self.clock.now());
        self.repository.save_session(&session)?;
        self.repository.set_active_session(&job.id, &session.id)?;
        for url in &destinations {
            self.breaker.record_success(url)?;
        }
        if kind == StartKind::Fresh {
            self.registry.increment_load(&node.id)?;
        }
        job.status = JobStatus::Streaming;
        job.last_error = None;
        job.updated_at = self.clock.now();
        self.repository.save_job(&job)?;

        info!(
            job_id = %job.id,
            session_id = %session.id,
            node_id = %node.id,
            strategy = %session.strategy,
            pid,
            fell_back = session.fell_back,
            handover = session.handover_from.is_some(),
            "stream started"
        );
        Ok(StartReport {
            session_id: session.id,
            job_id: job.id,
            node_id: node.id.clone(),
            strategy: session.strategy,
            fell_back: session.fell_back,
            blocked_destinations: blocked,
            already_active: false,
        })
    }

    pub async fn stop_stream(&self, session_id: &str, reason: &str) -> LifecycleResult<CleanupSummary> {
        self.stop_session(session_id, reason, StopKind::Terminate)
            .await
    }

    /// Stops whatever session is active for the job. Returns `None` when the
    /// job had no active session; the job is still marked STOPPED.
    pub async fn stop_job(&self, job_id: &str, reason: &str) -> LifecycleResult<Option<CleanupSummary>> {
        match self.repository.active_session(job_id)? {
            Some(session) => Ok(Some(self.stop_stream(&session.id, reason).await?)),
            None => {
                let mut job = self
                    .repository
                    .job(job_id)?
                    .ok_or_else(|| LifecycleError::JobNotFound(job_id.to_string()))?;
                job.status = JobStatus::Stopped;
                job.updated_at = self.clock.now();
                self.repository.save_job(&job)?;
                debug!(job_id = %job_id, "stop requested for job without active session");
                Ok(None)
            }
        }
    }

    /// Stop protocol. Remote cleanup is best-effort; problems are collected
    /// as warnings and the session is marked STOPPED regardless.
    pub async fn stop_session(
        &self,
        session_id: &str,
        reason: &str,
        kind: StopKind,
    ) -> LifecycleResult<CleanupSummary> {
        let mut session = self
            .repository
            .session(session_id)?
            .filter(|session| !session.status.is_terminal())
            .ok_or_else(|| LifecycleError::SessionNotFound(session_id.to_string()))?;
        // The load counter is only incremented once a session reaches ACTIVE.
        if session.status != SessionStatus::Active {
            return Err(LifecycleError::SessionNotActive(session_id.to_string()));
        }
        let mut job = self.repository.job(&session.job_id)?;
        if kind == StopKind::Terminate {
            if let Some(job) = job.as_mut() {
                job.status = JobStatus::Stopping;
                job.updated_at = self.clock.now();
                self.repository.save_job(job)?;
            }
        }

        let mut summary = CleanupSummary {
            session_id: session.id.clone(),
            node_id: session.node_id.clone(),
            ..CleanupSummary::default()
        };
        match self.registry.get(&session.node_id)? {
            Some(node) => {
                self.terminate_process(&node, &session, &mut summary).await;
                if session.strategy == StreamingStrategy::DownloadStreaming {
                    if let Some(path) = session.local_path.clone() {
                        self.delete_local_file(&node, &path, &mut summary).await;
                    }
                }
                self.sweep_temp(&node, &session.job_id, &mut summary).await;
            }
            None => summary
                .warnings
                .push(format!("node {} not registered, remote cleanup skipped", session.node_id)),
        }

        if kind == StopKind::Terminate {
            self.registry.decrement_load(&session.node_id)?;
        }
        session.status = SessionStatus::Stopped;
        session.stopped_at = Some(self.clock.now());
        session.stop_reason = Some(reason.to_string());
        self.repository.save_session(&session)?;
        self.repository
            .clear_active_session(&session.job_id, &session.id)?;

        if let Some(mut job) = job {
            if job.source.downloaded_to_node.as_deref() == Some(session.node_id.as_str()) {
                job.source.downloaded_to_node = None;
            }
            if kind == StopKind::Terminate {
                job.status = JobStatus::Stopped;
            }
            job.updated_at = self.clock.now();
            self.repository.save_job(&job)?;
        }

        for warning in &summary.warnings {
            warn!(session_id = %session.id, node_id = %session.node_id, %warning, "cleanup problem");
        }
        info!(
            job_id = %session.job_id,
            session_id = %session.id,
            node_id = %session.node_id,
            reason,
            bytes_freed = summary.bytes_freed,
            forced_kill = summary.forced_kill,
            "stream stopped"
        );
        Ok(summary)
    }

    pub fn session_is_active(&self, session_id: &str) -> LifecycleResult<bool> {
        Ok(self
            .repository
            .session(session_id)?
            .map(|session| session.status == SessionStatus::Active)
            .unwrap_or(false))
    }

    async fn download_source(
        &self,
        job: &StreamJob,
        session: &StreamSession,
        node: &Node,
    ) -> Result<String, String> {
        let path = format!(
            "{}/{}_{}_{}",
            self.config.download_dir,
            job.id,
            session.id,
            sanitize_filename(&job.source.filename)
        );
        let command = format!(
            "mkdir -p {} && curl -fsSL --max-time {} -o {} {}",
            shell_quote(&self.config.download_dir),
            self.config.download_timeout_seconds,
            shell_quote(&path),
            shell_quote(&job.source.url)
        );
        match self.remote.execute_checked(node, &command).await {
            Ok(_) => Ok(path),
            Err(err) => {
                self.remove_partial(node, &path).await;
                Err(err.to_string())
            }
        }
    }

    /// Breaker bookkeeping must not mask the start failure itself.
    fn record_destination_failures(&self, destinations: &[String], reason: &str) {
        for url in destinations {
            if let Err(error) = self.breaker.record_failure(url, reason) {
                warn!(%url, %error, "could not record destination failure");
            }
        }
    }

    async fn fail_start(
        &self,
        job: &mut StreamJob,
        session: &mut StreamSession,
        node: &Node,
        reason: String,
    ) -> LifecycleResult<LifecycleError> {
        if let Some(path) = session.local_path.take() {
            self.remove_partial(node, &path).await;
            if job.source.downloaded_to_node.as_deref() == Some(node.id.as_str()) {
                job.source.downloaded_to_node = None;
            }
        }
        session.status = SessionStatus::Failed;
        session.failure_reason = Some(reason.clone());
        session.stopped_at = Some(self.clock.now());
        self.repository.save_session(session)?;
        job.last_error = Some(reason.clone());
        job.updated_at = self.clock.now();
        self.repository.save_job(job)?;
        Ok(LifecycleError::StartFailed {
            node_id: node.id.clone(),
            reason,
        })
    }

    async fn remove_partial(&self, node: &Node, path: &str) {
        let command = format!("rm -f {}", shell_quote(path));
        if let Err(error) = self.remote.execute(node, &command).await {
            warn!(node_id = %node.id, path, %error, "failed to remove partial download");
        }
    }

    async fn terminate_process(&self, node: &Node, session: &StreamSession, summary: &mut CleanupSummary) {
        if let Some(pid) = session.pid {
            let command = format!(
                "kill -TERM {pid} 2>/dev/null; sleep {grace}; \
                 if kill -0 {pid} 2>/dev/null; then kill -KILL {pid}; echo forced; else echo terminated; fi",
                grace = self.config.kill_grace_seconds
            );
            match self.remote.execute(node, &command).await {
                Ok(output) => {
                    summary.process_terminated = true;
                    summary.forced_kill = output.last_line() == Some("forced");
                }
                Err(err) => summary
                    .warnings
                    .push(format!("terminating pid {pid} failed: {err}")),
            }
        } else {
            summary
                .warnings
                .push("no pid recorded, relying on marker sweep".to_string());
        }

        // The bracket keeps pkill from matching the shell running it.
        let marker = job_marker(&session.job_id);
        let pattern = format!("[{}]{}", &marker[..1], &marker[1..]);
        let sweep = format!("pkill -KILL -f {} || true", shell_quote(&pattern));
        match self.remote.execute(node, &sweep).await {
            Ok(_) => summary.process_terminated = true,
            Err(err) => summary
                .warnings
                .push(format!("stray process sweep failed: {err}")),
        }
    }

    async fn delete_local_file(&self, node: &Node, path: &str, summary: &mut CleanupSummary) {
        let quoted = shell_quote(path);
        let command = format!(
            "if [ -f {quoted} ]; then stat -c %s {quoted}; rm -f {quoted}; else echo missing; fi"
        );
        match self.remote.execute(node, &command).await {
            Ok(output) if output.success() => match output.last_line() {
                Some("missing") => summary
                    .warnings
                    .push(format!("local file {path} already gone")),
                Some(line) => {
                    summary.file_deleted = true;
                    summary.bytes_freed = line.parse().unwrap_or(0);
                }
                None => summary.file_deleted = true,
            },
            Ok(output) => summary.warnings.push(format!(
                "deleting {path} failed: {}",
                output.stderr.trim()
            )),
            Err(err) => summary.warnings.push(format!("deleting {path} failed: {err}")),
        }
    }

    async fn sweep_temp(&self, node: &Node, job_id: &str, summary: &mut CleanupSummary) {
        let command = format!(
            "rm -rf -- {}* 2>/dev/null; true",
            shell_quote(&format!("{}/{}_", self.config.temp_dir, job_id))
        );
        match self.remote.execute(node, &command).await {
            Ok(_) => summary.temp_swept = true,
            Err(err) => summary.warnings.push(format!("temp sweep failed: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::MediaFile;

    fn job(destinations: &[&str]) -> StreamJob {
        StreamJob::new(
            "job-1",
            "user-1",
            "Evening",
            MediaFile::new("f1", "talk.mp4", "https://cdn.example.com/talk.mp4", 1024),
            destinations.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn single_destination_uses_flv_output() {
        let config = LifecycleSection::default();
        let job = job(&["rtmp://a.example.com/live/k"]);
        let command = build_stream_command(
            &config,
            &job,
            "s1",
            "https://cdn.example.com/talk.mp4",
            &job.destinations,
        );
        assert!(command.contains("-f flv 'rtmp://a.example.com/live/k'"));
        assert!(command.contains("comment=streamfleet_job_job-1"));
        assert!(command.ends_with("& echo $!"));
        assert!(!command.contains("-stream_loop"));
    }

    #[test]
    fn multiple_destinations_use_tee_muxer() {
        let config = LifecycleSection::default();
        let mut job = job(&["rtmp://a/live/1", "rtmp://b/live/2"]);
        job.loop_enabled = true;
        let command = build_stream_command(&config, &job, "s1", "/opt/in.mp4", &job.destinations);
        assert!(command.contains("-stream_loop -1"));
        assert!(command.contains("-f tee '[f=flv:onfail=ignore]rtmp://a/live/1|[f=flv:onfail=ignore]rtmp://b/live/2'"));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("my talk (1).mp4"), "my_talk__1_.mp4");
        assert_eq!(sanitize_filename(".."), "source.bin");
    }
}
