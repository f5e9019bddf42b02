//! Control plane configuration (`ftl.toml`).
//!
//! Durations are plain integer seconds. Every section has defaults so a
//! minimal file only needs the values that differ.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::keys::DeploymentKey;
use crate::schema::{Module, ModuleRuntime, RuntimeBase};

/// Leases shorter than this are refused by every lease store.
pub const MIN_LEASE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub lease: LeaseConfig,
    /// How long a gap in runner heartbeats is tolerated.
    pub runner_timeout_secs: u64,
    /// TTL of a runner's claim on a deployment.
    pub deployment_reservation_timeout_secs: u64,
    /// Upper bound on waiting for a kube deployment to become ready.
    pub deploy_timeout_secs: u64,
    pub controller: ControllerConfig,
    pub local: LocalConfig,
    pub kube: KubeConfig,
    pub deployments: Vec<DeclaredDeployment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub ttl_secs: u64,
    /// Lease service endpoint for the client-backed leaser.
    pub endpoint: Option<Url>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// URL published in lease metadata when this process leads.
    pub advertise: Option<Url>,
    /// Controller endpoints handed to runners, round-robin.
    pub endpoints: Vec<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub max_exits: u32,
    pub ide_integration: bool,
    /// Directory searched upward for `.vscode` when publishing debug ports.
    pub project_path: Option<PathBuf>,
    pub runner_binary: PathBuf,
    /// Defaults to the user cache directory.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    pub istio: bool,
    /// Value injected into runners as `FTL_ENDPOINT`.
    pub controller_endpoint: Option<Url>,
    pub replicas: ReplicaPolicy,
}

/// How many replicas a kube deployment should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ReplicaPolicy {
    /// Always this many.
    Fixed { count: i32 },
    /// The module's declared `minReplicas`, or `fallback` when undeclared.
    MinReplicas { fallback: i32 },
}

impl ReplicaPolicy {
    pub fn replicas_for(&self, module: &Module) -> i32 {
        match *self {
            ReplicaPolicy::Fixed { count } => count,
            ReplicaPolicy::MinReplicas { fallback } => module.min_replicas().unwrap_or(fallback),
        }
    }
}

impl Default for ReplicaPolicy {
    fn default() -> Self {
        ReplicaPolicy::Fixed { count: 1 }
    }
}

/// A deployment the provisioner daemon converges on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredDeployment {
    pub module: String,
    pub deployment: DeploymentKey,
    pub language: String,
    #[serde(default)]
    pub image: Option<String>,
}

impl DeclaredDeployment {
    /// Minimal schema for the declared module.
    pub fn to_module(&self) -> Module {
        Module {
            name: self.module.clone(),
            runtime: Some(ModuleRuntime {
                base: RuntimeBase {
                    language: self.language.clone(),
                    image: self.image.clone(),
                },
                scaling: None,
            }),
            decls: Vec::new(),
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            lease: LeaseConfig::default(),
            runner_timeout_secs: 5,
            deployment_reservation_timeout_secs: 120,
            deploy_timeout_secs: 300,
            controller: ControllerConfig::default(),
            local: LocalConfig::default(),
            kube: KubeConfig::default(),
            deployments: Vec::new(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            endpoint: None,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_exits: 10,
            ide_integration: false,
            project_path: None,
            runner_binary: PathBuf::from("ftl-runner"),
            cache_dir: None,
        }
    }
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            istio: true,
            controller_endpoint: None,
            replicas: ReplicaPolicy::default(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ControlPlaneConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl() < MIN_LEASE_TTL {
            return Err(ConfigError::Invalid(format!(
                "lease.ttl_secs must be at least {}, got {}",
                MIN_LEASE_TTL.as_secs(),
                self.lease.ttl_secs
            )));
        }
        if self.deploy_timeout_secs == 0 {
            return Err(ConfigError::Invalid("deploy_timeout_secs must be positive".into()));
        }
        if let ReplicaPolicy::Fixed { count } = self.kube.replicas {
            if count < 0 {
                return Err(ConfigError::Invalid(format!(
                    "kube.replicas.count must not be negative, got {count}"
                )));
            }
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease.ttl_secs)
    }

    pub fn runner_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_timeout_secs)
    }

    pub fn deployment_reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_reservation_timeout_secs)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }
}
