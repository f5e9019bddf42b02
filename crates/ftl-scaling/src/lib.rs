//! ftl-scaling — turn declared deployments into running runners.
//!
//! Two engines implement [`RunnerScaling`]:
//! - [`k8s::KubeScaling`] creates a Service, ServiceAccount, optional Istio
//!   policies and a Deployment per deployment key, from templates stored in
//!   the controller's ConfigMap.
//! - [`local::LocalScaling`] supervises runner processes on this machine.
//!
//! [`k8s::DeploymentProvisioner`] is the older schema-event driven variant
//! of the kube engine.

pub mod error;
pub mod image;
pub mod k8s;
pub mod local;
pub mod retry;

use async_trait::async_trait;
use ftl_core::{DeploymentKey, Module};
use tokio_util::sync::CancellationToken;
use url::Url;

pub use error::{KubeError, KubeResult, ScalingError, ScalingResult};
pub use image::ImageError;
pub use retry::{Retry, RetryError};

/// Brings runners for deployments up and down.
#[async_trait]
pub trait RunnerScaling: Send + Sync {
    /// One-shot initialisation. May block on discovering external resources.
    async fn start(&self, ctx: &CancellationToken) -> ScalingResult<()>;

    /// Declare that `deployment` should run at its natural replica count.
    async fn start_deployment(
        &self,
        ctx: &CancellationToken,
        module: &str,
        deployment: &DeploymentKey,
        schema: &Module,
        has_cron: bool,
        has_ingress: bool,
    ) -> ScalingResult<()>;

    /// Declare that `deployment` must not run.
    async fn terminate_deployment(
        &self,
        ctx: &CancellationToken,
        module: &str,
        deployment: &DeploymentKey,
    ) -> ScalingResult<()>;

    /// Base URL at which a runner for `deployment` accepts calls, if any.
    async fn get_endpoint_for_deployment(
        &self,
        module: &str,
        deployment: &DeploymentKey,
    ) -> ScalingResult<Option<Url>>;
}
