use std::time::Duration;

use anyhow::Result;

/// Connection parameters for one SSH exchange with the device.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SshCommand {
    pub target: SshTarget,
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SshOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Consumed interface: the SSH transport is provided by the embedding
/// application. The orchestrator only drives the service restart through it.
pub trait SshClient: Send + Sync {
    fn test_connection(&self, target: &SshTarget) -> Result<()>;
    fn execute_command(&self, command: &SshCommand) -> Result<SshOutput>;
}

/// Placeholder used when no SSH transport is wired in; restarts are skipped
/// with a log entry instead of failing the renewal.
pub struct NoSshClient;

impl SshClient for NoSshClient {
    fn test_connection(&self, _target: &SshTarget) -> Result<()> {
        anyhow::bail!("no SSH client configured")
    }

    fn execute_command(&self, _command: &SshCommand) -> Result<SshOutput> {
        anyhow::bail!("no SSH client configured")
    }
}
