use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::SshSection;
use crate::fleet::Node;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command failed on {node_id} ({command}): {stderr}")]
    CommandFailure {
        node_id: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
    }
}

/// Runs shell commands and transfers files on worker nodes.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Returns the output even when the remote command exits non-zero;
    /// only transport problems are errors.
    async fn execute(&self, node: &Node, command: &str) -> Result<CommandOutput, RemoteError>;

    async fn upload_file(&self, node: &Node, local: &Path, remote: &str)
        -> Result<(), RemoteError>;

    /// Like [`RemoteExecutor::execute`] but treats a non-zero exit as failure.
    async fn execute_checked(
        &self,
        node: &Node,
        command: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let output = self.execute(node, command).await?;
        if !output.success() {
            return Err(RemoteError::CommandFailure {
                node_id: node.id.clone(),
                command: command.to_string(),
                status: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// [`RemoteExecutor`] over the system `ssh`/`scp` binaries.
pub struct SshExecutor {
    config: SshSection,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshExecutor")
            .field("config", &self.config)
            .finish()
    }
}

impl SshExecutor {
    pub fn new(config: SshSection, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self { config, executor }
    }

    fn common_options(&self, command: &mut Command, port_flag: &str, node: &Node) {
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout_seconds
            ))
            .arg(port_flag)
            .arg(node.ssh_port.to_string());
        if !self.config.strict_host_key_checking {
            command.arg("-o").arg("StrictHostKeyChecking=no");
        }
        if let Some(identity) = &self.config.identity_file {
            command.arg("-i").arg(identity);
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, node: &Node, remote_command: &str) -> Result<CommandOutput, RemoteError> {
        let mut command = Command::new(&self.config.ssh_binary);
        self.common_options(&mut command, "-p", node);
        command.arg(node.ssh_target()).arg(remote_command);
        debug!(node_id = %node.id, command = remote_command, "executing remote command");
        let output = self.executor.run(&mut command).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    async fn upload_file(
        &self,
        node: &Node,
        local: &Path,
        remote: &str,
    ) -> Result<(), RemoteError> {
        let mut command = Command::new(&self.config.scp_binary);
        self.common_options(&mut command, "-P", node);
        command
            .arg(local)
            .arg(format!("{}:{}", node.ssh_target(), remote));
        let output = self.executor.run(&mut command).await?;
        if !output.status.success() {
            return Err(RemoteError::CommandFailure {
                node_id: node.id.clone(),
                command: format!("scp {} {}", local.display(), remote),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
