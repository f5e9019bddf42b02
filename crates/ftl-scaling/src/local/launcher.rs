//! Launching runner processes.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use ftl_core::{DeploymentKey, RunnerKey};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Everything a runner needs to serve one deployment.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub bind: Url,
    pub controller_endpoint: Url,
    pub lease_endpoint: Option<Url>,
    pub key: RunnerKey,
    pub deployment: DeploymentKey,
    pub deployment_dir: PathBuf,
    pub language: String,
    /// Zero when debugging is off.
    pub debug_port: u16,
    pub dev_endpoint: Option<Url>,
    pub dev_runner_info_file: Option<PathBuf>,
    pub heartbeat_period: Duration,
    pub heartbeat_jitter: Duration,
}

impl RunnerConfig {
    /// Environment the runner process reads its configuration from.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("FTL_BIND", self.bind.to_string()),
            ("FTL_ENDPOINT", self.controller_endpoint.to_string()),
            ("FTL_RUNNER_KEY", self.key.to_string()),
            ("FTL_DEPLOYMENT", self.deployment.to_string()),
            ("FTL_DEPLOYMENT_DIR", self.deployment_dir.display().to_string()),
            ("FTL_LANGUAGE", self.language.clone()),
            ("FTL_HEARTBEAT_PERIOD_MS", self.heartbeat_period.as_millis().to_string()),
            ("FTL_HEARTBEAT_JITTER_MS", self.heartbeat_jitter.as_millis().to_string()),
        ];
        if let Some(lease) = &self.lease_endpoint {
            env.push(("FTL_LEASE_ENDPOINT", lease.to_string()));
        }
        if self.debug_port != 0 {
            env.push(("FTL_DEBUG_PORT", self.debug_port.to_string()));
        }
        if let Some(dev) = &self.dev_endpoint {
            env.push(("FTL_DEV_ENDPOINT", dev.to_string()));
        }
        if let Some(file) = &self.dev_runner_info_file {
            env.push(("FTL_DEV_RUNNER_INFO_FILE", file.display().to_string()));
        }
        env
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    /// The runner was stopped through its context. Never counts as a crash.
    #[error("runner cancelled")]
    Cancelled,

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("runner exited with {0}")]
    Exited(ExitStatus),

    #[error("failed to wait for runner: {0}")]
    Wait(#[source] io::Error),

    #[error("{0}")]
    Other(String),
}

impl LaunchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LaunchError::Cancelled)
    }
}

/// Runs a runner until it exits or `ctx` is cancelled.
#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    async fn launch(&self, ctx: CancellationToken, config: RunnerConfig) -> Result<(), LaunchError>;
}

/// Launches the runner binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl RunnerLauncher for ProcessLauncher {
    async fn launch(&self, ctx: CancellationToken, config: RunnerConfig) -> Result<(), LaunchError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .envs(config.env())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;
        info!(runner = %config.key, deployment = %config.deployment, bind = %config.bind, pid = child.id(), "runner started");

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(LaunchError::Wait)?;
                debug!(runner = %config.key, %status, "runner exited");
                if status.success() {
                    Ok(())
                } else {
                    Err(LaunchError::Exited(status))
                }
            }
            _ = ctx.cancelled() => {
                // Already exited is fine.
                let _ = child.kill().await;
                debug!(runner = %config.key, "runner killed");
                Err(LaunchError::Cancelled)
            }
        }
    }
}
