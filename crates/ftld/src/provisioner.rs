//! Provisioner role: elect a leader, run a scaling engine while leading.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use ftl_core::{ChangeType, ControlPlaneConfig, SchemaChange};
use ftl_leader::{Coordinator, follower_factory, leader_factory};
use ftl_lease::{GrpcLeaser, Key, Leaser};
use ftl_scaling::RunnerScaling;
use ftl_scaling::k8s::{DeploymentProvisioner, KubeClient, KubeScaling, KubeSettings};
use ftl_scaling::local::{IdeIntegration, LocalScaling, LocalSettings, ProcessLauncher};
use ftl_status::{SharedStatus, TerminalStatus};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::Mode;

/// What [`Coordinator::get`] hands out.
#[derive(Clone)]
pub enum Role {
    /// This process leads. The engine is absent in legacy mode, which is
    /// driven by schema changes rather than endpoint lookups.
    Leader(Option<Arc<dyn RunnerScaling>>),
    Follower(Url),
}

pub async fn run(ctx: CancellationToken, path: &Path, mode: Mode, advertise: Option<Url>) -> anyhow::Result<()> {
    let config = ControlPlaneConfig::from_file(path)?;
    let lease_endpoint = config
        .lease
        .endpoint
        .clone()
        .context("lease.endpoint must be set to run the provisioner")?;
    let advertise = advertise
        .or_else(|| config.controller.advertise.clone())
        .context("no advertise URL: pass --advertise or set controller.advertise")?;
    let leaser: Arc<dyn Leaser> = Arc::new(GrpcLeaser::connect_lazy(&lease_endpoint)?);
    let status: SharedStatus = Arc::new(TerminalStatus::stderr());

    info!(?mode, %advertise, lease = %lease_endpoint, "provisioner starting");
    let config = Arc::new(config);
    let coordinator = start_coordinator(ctx.clone(), leaser, advertise, mode, Arc::clone(&config), status);

    let mut ticker = tokio::time::interval(coordinator.reconcile_interval());
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = ticker.tick() => report(&coordinator, &config).await,
        }
    }
    info!("provisioner stopped");
    Ok(())
}

pub fn start_coordinator(
    ctx: CancellationToken,
    leaser: Arc<dyn Leaser>,
    advertise: Url,
    mode: Mode,
    config: Arc<ControlPlaneConfig>,
    status: SharedStatus,
) -> Coordinator<Role> {
    let ttl = config.lease_ttl();
    let fallback_controller = advertise.clone();
    let leader = leader_factory(move |lease_ctx: CancellationToken| {
        let config = Arc::clone(&config);
        let status = Arc::clone(&status);
        let controller = fallback_controller.clone();
        async move { lead(lease_ctx, mode, config, status, controller).await }
    });
    let follower = follower_factory(|_ctx, url: Url| async move {
        info!(leader = %url, "following provisioner leader");
        Ok(Role::Follower(url))
    });
    Coordinator::new(ctx, advertise, Key::system(["provisioner"]), leaser, ttl, leader, follower)
}

/// Runs on every acquisition of the lease. Everything started here is tied
/// to `lease_ctx` and stops when leadership ends.
async fn lead(
    lease_ctx: CancellationToken,
    mode: Mode,
    config: Arc<ControlPlaneConfig>,
    status: SharedStatus,
    fallback_controller: Url,
) -> anyhow::Result<Role> {
    info!(?mode, "acquired provisioner lease");
    match mode {
        Mode::Local => {
            let engine: Arc<dyn RunnerScaling> =
                Arc::new(local_engine(&lease_ctx, &config, status, fallback_controller)?);
            engine.start(&lease_ctx).await?;
            tokio::spawn(converge(lease_ctx, Arc::clone(&engine), config));
            Ok(Role::Leader(Some(engine)))
        }
        Mode::Kube => {
            let mut settings = KubeSettings::new(kube_controller(&config, fallback_controller));
            settings.istio = config.kube.istio;
            settings.replicas = config.kube.replicas;
            settings.deploy_timeout = config.deploy_timeout();
            let engine: Arc<dyn RunnerScaling> = Arc::new(KubeScaling::new(settings, status));
            engine.start(&lease_ctx).await?;
            tokio::spawn(converge(lease_ctx, Arc::clone(&engine), config));
            Ok(Role::Leader(Some(engine)))
        }
        Mode::KubeLegacy => {
            let client = KubeClient::connect(config.kube.istio).await?;
            let provisioner =
                DeploymentProvisioner::new(Arc::new(client), kube_controller(&config, fallback_controller), status);
            let changes = declared_changes(&config);
            tokio::spawn(async move {
                provisioner
                    .run(lease_ctx, futures::stream::iter(changes).boxed())
                    .await
            });
            Ok(Role::Leader(None))
        }
    }
}

fn local_engine(
    ctx: &CancellationToken,
    config: &ControlPlaneConfig,
    status: SharedStatus,
    fallback_controller: Url,
) -> anyhow::Result<LocalScaling> {
    let local = &config.local;
    let mut endpoints = config.controller.endpoints.clone();
    if endpoints.is_empty() {
        endpoints.push(fallback_controller);
    }
    let cache_dir = local.cache_dir.clone().unwrap_or_else(default_cache_dir);
    let mut settings = LocalSettings::new(cache_dir, endpoints);
    settings.lease_endpoint = config.lease.endpoint.clone();
    settings.max_exits = local.max_exits;
    if local.ide_integration {
        let project = match &local.project_path {
            Some(path) => path.clone(),
            None => std::env::current_dir().context("resolving project path for IDE integration")?,
        };
        settings.ide = Some(IdeIntegration::new(project));
    }
    let launcher = Arc::new(ProcessLauncher::new(&local.runner_binary));
    Ok(LocalScaling::new(ctx.clone(), launcher, settings, status, None))
}

fn kube_controller(config: &ControlPlaneConfig, fallback: Url) -> Url {
    config
        .kube
        .controller_endpoint
        .clone()
        .or_else(|| config.controller.endpoints.first().cloned())
        .unwrap_or(fallback)
}

/// `$XDG_CACHE_HOME/ftl`, `~/.cache/ftl`, or a directory under the system temp dir.
fn default_cache_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("ftl")
}

/// Declared deployments as the initial snapshot of a schema event stream.
fn declared_changes(config: &ControlPlaneConfig) -> Vec<SchemaChange> {
    let count = config.deployments.len();
    config
        .deployments
        .iter()
        .enumerate()
        .map(|(i, declared)| SchemaChange {
            module_name: declared.module.clone(),
            deployment_key: Some(declared.deployment),
            schema: declared.to_module(),
            change_type: ChangeType::Added,
            more: i + 1 < count,
        })
        .collect()
}

async fn converge(ctx: CancellationToken, engine: Arc<dyn RunnerScaling>, config: Arc<ControlPlaneConfig>) {
    for declared in &config.deployments {
        if ctx.is_cancelled() {
            return;
        }
        let module = declared.to_module();
        let result = engine
            .start_deployment(&ctx, &declared.module, &declared.deployment, &module, false, false)
            .await;
        match result {
            Ok(()) => debug!(module = %declared.module, deployment = %declared.deployment, "deployment converged"),
            Err(err) => warn!(module = %declared.module, deployment = %declared.deployment, error = %err, "failed to start deployment"),
        }
    }
}

async fn report(coordinator: &Coordinator<Role>, config: &ControlPlaneConfig) {
    match coordinator.get().await {
        Ok(Role::Leader(Some(engine))) => {
            for declared in &config.deployments {
                match engine
                    .get_endpoint_for_deployment(&declared.module, &declared.deployment)
                    .await
                {
                    Ok(Some(endpoint)) => {
                        debug!(module = %declared.module, deployment = %declared.deployment, %endpoint, "runner endpoint")
                    }
                    Ok(None) => debug!(module = %declared.module, deployment = %declared.deployment, "no runner yet"),
                    Err(err) => debug!(module = %declared.module, error = %err, "endpoint lookup failed"),
                }
            }
        }
        Ok(Role::Leader(None)) => debug!("leading provisioner"),
        Ok(Role::Follower(leader)) => debug!(%leader, "following provisioner"),
        Err(err) => warn!(error = %err, "provisioner coordination failed"),
    }
}
