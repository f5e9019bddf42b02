//! Local scaling engine: one runner process per wanted deployment.
//!
//! All bookkeeping sits behind a single lock. Runner exit handlers take
//! the same lock to record the exit and reconcile again, so a crashing
//! runner is restarted until it has exited `max_exits` times.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ftl_core::{DeploymentKey, Module, RunnerKey};
use ftl_status::{ModuleState, SharedStatus};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::balancer::RoundRobin;
use super::ide::{DebugInfo, IdeIntegration};
use super::launcher::{LaunchError, RunnerConfig, RunnerLauncher};
use super::ports::allocate_port;
use crate::RunnerScaling;
use crate::error::{ScalingError, ScalingResult};

const LOCAL_HOST: &str = "127.0.0.1";

/// A module served by a developer's own process instead of a runner we
/// launch.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub module: String,
    pub endpoint: Url,
    pub language: String,
    /// Zero when the process is not debuggable.
    pub debug_port: u16,
    pub runner_info_file: Option<PathBuf>,
}

#[derive(Debug)]
pub struct LocalSettings {
    pub cache_dir: PathBuf,
    pub controller_endpoints: Vec<Url>,
    pub lease_endpoint: Option<Url>,
    pub max_exits: u32,
    pub ide: Option<IdeIntegration>,
    /// Delay between dropping a runner and cancelling it.
    pub termination_grace: Duration,
    pub heartbeat_period: Duration,
    pub heartbeat_jitter: Duration,
}

impl LocalSettings {
    pub fn new(cache_dir: impl Into<PathBuf>, controller_endpoints: Vec<Url>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            controller_endpoints,
            lease_endpoint: None,
            max_exits: 10,
            ide: None,
            termination_grace: Duration::from_secs(5),
            heartbeat_period: Duration::from_secs(1),
            heartbeat_jitter: Duration::from_millis(100),
        }
    }
}

struct RunnerRecord {
    id: u64,
    cancel: CancellationToken,
    host: String,
    port: u16,
}

struct DeploymentRecord {
    module: String,
    language: String,
    replicas: i32,
    exits: u32,
    runner: Option<RunnerRecord>,
}

struct DevRunner {
    endpoint: Url,
    /// Deployment the dev process is currently serving.
    deployment: Option<DeploymentKey>,
    debug_port: u16,
    runner_info_file: Option<PathBuf>,
}

#[derive(Default)]
struct State {
    deployments: HashMap<DeploymentKey, DeploymentRecord>,
    modules: HashMap<String, BTreeSet<DeploymentKey>>,
    debug_ports: BTreeMap<String, DebugInfo>,
    dev_runners: HashMap<String, DevRunner>,
    next_suffix: u64,
}

struct Inner {
    /// Root context; every runner gets a child of it.
    ctx: CancellationToken,
    launcher: Arc<dyn RunnerLauncher>,
    controllers: RoundRobin<Url>,
    settings: LocalSettings,
    state: Mutex<State>,
    status: SharedStatus,
    dev_updates: Mutex<Option<mpsc::Receiver<LocalEndpoint>>>,
    /// Latest debug port table for the IDE writer, when integration is on.
    ide_ports: Option<watch::Sender<BTreeMap<String, DebugInfo>>>,
}

/// Writes debug port tables to the IDE on the blocking pool, one at a
/// time. Tables published while a write is in flight collapse into the
/// latest one. Stops once the sender is dropped.
fn spawn_ide_writer(ide: IdeIntegration) -> watch::Sender<BTreeMap<String, DebugInfo>> {
    let (ports_tx, mut ports_rx) = watch::channel(BTreeMap::new());
    let ide = Arc::new(ide);
    tokio::spawn(async move {
        while ports_rx.changed().await.is_ok() {
            let ports = ports_rx.borrow_and_update().clone();
            let ide = Arc::clone(&ide);
            match tokio::task::spawn_blocking(move || ide.sync(&ports)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to sync ide debug configuration"),
                Err(err) => error!(error = %err, "ide sync task failed"),
            }
        }
    });
    ports_tx
}

#[derive(Clone)]
pub struct LocalScaling {
    inner: Arc<Inner>,
}

impl LocalScaling {
    /// Must be called within a tokio runtime when `settings.ide` is set.
    pub fn new(
        ctx: CancellationToken,
        launcher: Arc<dyn RunnerLauncher>,
        mut settings: LocalSettings,
        status: SharedStatus,
        dev_updates: Option<mpsc::Receiver<LocalEndpoint>>,
    ) -> Self {
        let controllers = RoundRobin::new(std::mem::take(&mut settings.controller_endpoints));
        let ide_ports = settings.ide.take().map(spawn_ide_writer);
        Self {
            inner: Arc::new(Inner {
                ctx,
                launcher,
                controllers,
                settings,
                state: Mutex::new(State::default()),
                status,
                dev_updates: Mutex::new(dev_updates),
                ide_ports,
            }),
        }
    }

    /// Declare how many runners `deployment` should have. Zero stops it,
    /// anything else keeps exactly one running.
    pub fn set_replicas(
        &self,
        module: &str,
        deployment: &DeploymentKey,
        language: &str,
        replicas: i32,
    ) -> ScalingResult<()> {
        let inner = &self.inner;
        let mut state = inner.lock();
        debug!(%module, %deployment, replicas, "setting replicas");
        state
            .modules
            .entry(module.to_string())
            .or_default()
            .insert(*deployment);
        let record = state
            .deployments
            .entry(*deployment)
            .or_insert_with(|| DeploymentRecord {
                module: module.to_string(),
                language: language.to_string(),
                replicas: 0,
                exits: 0,
                runner: None,
            });
        record.replicas = replicas;
        inner.reconcile(&mut state, deployment)
    }

    /// Stop every other deployment of `module`, returning their keys.
    pub fn terminate_previous_deployments(
        &self,
        module: &str,
        deployment: &DeploymentKey,
    ) -> ScalingResult<Vec<DeploymentKey>> {
        let previous: Vec<DeploymentKey> = {
            let state = self.inner.lock();
            state
                .modules
                .get(module)
                .into_iter()
                .flatten()
                .filter(|key| *key != deployment)
                .copied()
                .collect()
        };
        debug!(%module, %deployment, previous = previous.len(), "terminating previous deployments");
        for key in &previous {
            self.set_replicas(module, key, "", 0)?;
        }
        Ok(previous)
    }

    /// Number of times the runner for `deployment` has exited.
    pub fn exits(&self, deployment: &DeploymentKey) -> Option<u32> {
        self.inner.lock().deployments.get(deployment).map(|d| d.exits)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconcile(self: &Arc<Self>, state: &mut State, deployment: &DeploymentKey) -> ScalingResult<()> {
        let Some(record) = state.deployments.get_mut(deployment) else {
            return Err(ScalingError::DeploymentNotFound(deployment.to_string()));
        };
        if record.replicas > 0 && record.runner.is_none() && record.exits < self.settings.max_exits {
            if let Err(err) = self.start_runner(state, deployment) {
                error!(%deployment, error = %err, "failed to start runner");
                return Err(err);
            }
        } else if record.replicas == 0 {
            if let Some(runner) = record.runner.take() {
                // Give every controller time to drop the runner from its
                // routing table before it goes away.
                let grace = self.settings.termination_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    runner.cancel.cancel();
                });
            }
        }
        Ok(())
    }

    fn start_runner(self: &Arc<Self>, state: &mut State, deployment: &DeploymentKey) -> ScalingResult<()> {
        if self.ctx.is_cancelled() {
            // Called after the lease was lost; nothing should start.
            return Ok(());
        }
        let (module, language) = match state.deployments.get(deployment) {
            Some(record) => (record.module.clone(), record.language.clone()),
            None => return Err(ScalingError::DeploymentNotFound(deployment.to_string())),
        };

        let mut debug_port = 0;
        let mut dev_endpoint = None;
        let mut dev_runner_info_file = None;
        if let Some(dev) = state.dev_runners.get_mut(&module) {
            if dev.deployment == Some(*deployment) {
                debug!(%module, %deployment, "dev runner already serving deployment");
                return Ok(());
            }
            dev.deployment = Some(*deployment);
            debug_port = dev.debug_port;
            dev_endpoint = Some(dev.endpoint.clone());
            dev_runner_info_file = dev.runner_info_file.clone();
        } else if let Some(ide_ports) = &self.ide_ports {
            let port = allocate_port().map_err(ScalingError::Port)?;
            state.debug_ports.insert(
                module.clone(),
                DebugInfo {
                    port,
                    language: language.clone(),
                },
            );
            ide_ports.send_replace(state.debug_ports.clone());
            debug_port = port;
        }

        let controller_endpoint = self
            .controllers
            .next()
            .cloned()
            .ok_or_else(|| ScalingError::Internal("no controller endpoints configured".into()))?;
        let port = allocate_port().map_err(ScalingError::Port)?;
        let suffix = state.next_suffix;
        state.next_suffix += 1;

        let simple_name = format!("runner{suffix}");
        let config = RunnerConfig {
            bind: Url::parse(&format!("http://{LOCAL_HOST}:{port}"))?,
            controller_endpoint,
            lease_endpoint: self.settings.lease_endpoint.clone(),
            key: RunnerKey::new_local(suffix),
            deployment: *deployment,
            deployment_dir: self
                .settings
                .cache_dir
                .join("ftl-runner")
                .join(&simple_name)
                .join("deployments"),
            language,
            debug_port,
            dev_endpoint,
            dev_runner_info_file,
            heartbeat_period: self.settings.heartbeat_period,
            heartbeat_jitter: self.settings.heartbeat_jitter,
        };

        let cancel = self.ctx.child_token();
        if let Some(record) = state.deployments.get_mut(deployment) {
            record.runner = Some(RunnerRecord {
                id: suffix,
                cancel: cancel.clone(),
                host: LOCAL_HOST.to_string(),
                port,
            });
        }
        info!(%module, %deployment, runner = %simple_name, %port, "starting runner");
        self.status.set_module_state(&module, ModuleState::Deploying);

        let inner = Arc::clone(self);
        let deployment = *deployment;
        tokio::spawn(async move {
            let result = inner.launcher.launch(cancel, config).await;
            inner.runner_exited(&module, &deployment, suffix, result);
        });
        Ok(())
    }

    fn runner_exited(
        self: &Arc<Self>,
        module: &str,
        deployment: &DeploymentKey,
        id: u64,
        result: Result<(), LaunchError>,
    ) {
        let mut state = self.lock();
        if let Some(dev) = state.dev_runners.get_mut(module) {
            if dev.deployment == Some(*deployment) {
                dev.deployment = None;
            }
        }
        let Some(record) = state.deployments.get_mut(deployment) else {
            return;
        };
        match result {
            Err(LaunchError::Cancelled) => debug!(%module, %deployment, "runner stopped"),
            // A runner is never expected to exit on its own.
            Ok(()) => {
                warn!(%module, %deployment, "runner exited");
                record.exits += 1;
            }
            Err(err) => {
                error!(%module, %deployment, error = %err, "runner failed");
                record.exits += 1;
            }
        }
        if record.exits >= self.settings.max_exits {
            error!(%module, %deployment, exits = record.exits, "runner failed too many times, not restarting");
            self.status.set_module_state(module, ModuleState::Failed);
        }
        if record.runner.as_ref().is_some_and(|r| r.id == id) {
            record.runner = None;
        }
        if let Err(err) = self.reconcile(&mut state, deployment) {
            error!(%module, %deployment, error = %err, "failed to reconcile runners");
        }
    }

    fn update_dev_endpoint(&self, state: &mut State, update: LocalEndpoint) {
        debug!(module = %update.module, endpoint = %update.endpoint, "dev endpoint updated");
        state.dev_runners.insert(
            update.module.clone(),
            DevRunner {
                endpoint: update.endpoint,
                deployment: None,
                debug_port: update.debug_port,
                runner_info_file: update.runner_info_file,
            },
        );
        let Some(ide_ports) = &self.ide_ports else {
            return;
        };
        if update.debug_port != 0 {
            state
                .debug_ports
                .entry(update.module.clone())
                .and_modify(|info| info.port = update.debug_port)
                .or_insert(DebugInfo {
                    port: update.debug_port,
                    language: update.language,
                });
        }
        ide_ports.send_replace(state.debug_ports.clone());
    }
}

#[async_trait]
impl RunnerScaling for LocalScaling {
    async fn start(&self, ctx: &CancellationToken) -> ScalingResult<()> {
        let updates = self
            .inner
            .dev_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut updates) = updates else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    update = updates.recv() => {
                        let Some(update) = update else { return };
                        let mut state = inner.lock();
                        inner.update_dev_endpoint(&mut state, update);
                    }
                }
            }
        });
        Ok(())
    }

    async fn start_deployment(
        &self,
        _ctx: &CancellationToken,
        module: &str,
        deployment: &DeploymentKey,
        schema: &Module,
        _has_cron: bool,
        _has_ingress: bool,
    ) -> ScalingResult<()> {
        if schema.runtime.is_none() {
            return Ok(());
        }
        self.set_replicas(module, deployment, schema.language(), 1)?;
        if self.exits(deployment).unwrap_or(0) < self.inner.settings.max_exits {
            self.inner.status.set_module_state(module, ModuleState::Deployed);
        }
        Ok(())
    }

    async fn terminate_deployment(
        &self,
        _ctx: &CancellationToken,
        module: &str,
        deployment: &DeploymentKey,
    ) -> ScalingResult<()> {
        self.set_replicas(module, deployment, "", 0)?;
        self.inner.status.set_module_state(module, ModuleState::Terminated);
        Ok(())
    }

    async fn get_endpoint_for_deployment(
        &self,
        module: &str,
        deployment: &DeploymentKey,
    ) -> ScalingResult<Option<Url>> {
        let state = self.inner.lock();
        let known = state
            .modules
            .get(module)
            .ok_or_else(|| ScalingError::ModuleNotFound(module.to_string()))?;
        let record = known
            .contains(deployment)
            .then(|| state.deployments.get(deployment))
            .flatten()
            .ok_or_else(|| ScalingError::DeploymentNotFound(deployment.to_string()))?;
        match &record.runner {
            Some(runner) => Ok(Some(Url::parse(&format!("http://{}:{}", runner.host, runner.port))?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use ftl_core::schema::{ModuleRuntime, RuntimeBase};
    use ftl_status::MemoryStatus;

    use super::*;

    #[derive(Clone, Copy)]
    enum Behaviour {
        ExitImmediately,
        RunUntilCancelled,
    }

    struct FakeLauncher {
        behaviour: Behaviour,
        launches: AtomicU32,
        stopped: AtomicU32,
        configs: Mutex<Vec<RunnerConfig>>,
    }

    impl FakeLauncher {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                launches: AtomicU32::new(0),
                stopped: AtomicU32::new(0),
                configs: Mutex::new(Vec::new()),
            })
        }

        fn launches(&self) -> u32 {
            self.launches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RunnerLauncher for FakeLauncher {
        async fn launch(&self, ctx: CancellationToken, config: RunnerConfig) -> Result<(), LaunchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.configs.lock().unwrap().push(config);
            match self.behaviour {
                Behaviour::ExitImmediately => Err(LaunchError::Other("boom".into())),
                Behaviour::RunUntilCancelled => {
                    ctx.cancelled().await;
                    self.stopped.fetch_add(1, Ordering::SeqCst);
                    Err(LaunchError::Cancelled)
                }
            }
        }
    }

    fn module(name: &str) -> Module {
        Module {
            name: name.into(),
            runtime: Some(ModuleRuntime {
                base: RuntimeBase {
                    language: "go".into(),
                    image: None,
                },
                scaling: None,
            }),
            decls: Vec::new(),
        }
    }

    fn engine(launcher: Arc<FakeLauncher>, max_exits: u32) -> (LocalScaling, Arc<MemoryStatus>) {
        let mut settings = LocalSettings::new(
            "/tmp/ftl-cache",
            vec![
                Url::parse("http://127.0.0.1:8892").unwrap(),
                Url::parse("http://127.0.0.1:8893").unwrap(),
            ],
        );
        settings.max_exits = max_exits;
        let status = Arc::new(MemoryStatus::new());
        let engine = LocalScaling::new(CancellationToken::new(), launcher, settings, status.clone(), None);
        (engine, status)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn crashing_runner_stops_restarting_after_max_exits() {
        let launcher = FakeLauncher::new(Behaviour::ExitImmediately);
        let (engine, status) = engine(launcher.clone(), 2);
        let ctx = CancellationToken::new();
        let key = DeploymentKey::new();

        engine.start_deployment(&ctx, "echo", &key, &module("echo"), false, false).await.unwrap();
        settle().await;

        assert_eq!(launcher.launches(), 2);
        assert_eq!(engine.exits(&key), Some(2));
        assert_eq!(engine.get_endpoint_for_deployment("echo", &key).await.unwrap(), None);
        assert_eq!(status.get("echo"), Some(ModuleState::Failed));

        // Asking again does not revive it.
        engine.set_replicas("echo", &key, "go", 1).unwrap();
        settle().await;
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn set_replicas_is_idempotent() {
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let (engine, _) = engine(launcher.clone(), 10);
        let key = DeploymentKey::new();

        engine.set_replicas("echo", &key, "go", 1).unwrap();
        engine.set_replicas("echo", &key, "go", 1).unwrap();
        settle().await;

        assert_eq!(launcher.launches(), 1);
        let url = engine.get_endpoint_for_deployment("echo", &key).await.unwrap().unwrap();
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        let configs = launcher.configs.lock().unwrap();
        assert_eq!(configs[0].bind.port(), url.port());
        assert_eq!(configs[0].key, RunnerKey::new_local(0));
        assert!(configs[0].deployment_dir.ends_with("ftl-runner/runner0/deployments"));
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_runner_is_cancelled_after_grace() {
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let (engine, status) = engine(launcher.clone(), 10);
        let ctx = CancellationToken::new();
        let key = DeploymentKey::new();

        engine.start_deployment(&ctx, "echo", &key, &module("echo"), false, false).await.unwrap();
        settle().await;
        engine.terminate_deployment(&ctx, "echo", &key).await.unwrap();
        assert_eq!(engine.get_endpoint_for_deployment("echo", &key).await.unwrap(), None);
        assert_eq!(status.get("echo"), Some(ModuleState::Terminated));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(launcher.stopped.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(launcher.stopped.load(Ordering::SeqCst), 1);
        // Cancellation is not an exit, and nothing was restarted.
        assert_eq!(engine.exits(&key), Some(0));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn terminate_previous_stops_other_deployments() {
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let (engine, _) = engine(launcher.clone(), 10);
        let old = DeploymentKey::new();
        let new = DeploymentKey::new();
        let other = DeploymentKey::new();

        engine.set_replicas("echo", &old, "go", 1).unwrap();
        engine.set_replicas("echo", &new, "go", 1).unwrap();
        engine.set_replicas("time", &other, "go", 1).unwrap();

        let stopped = engine.terminate_previous_deployments("echo", &new).unwrap();
        assert_eq!(stopped, vec![old]);
        assert_eq!(engine.get_endpoint_for_deployment("echo", &old).await.unwrap(), None);
        assert!(engine.get_endpoint_for_deployment("echo", &new).await.unwrap().is_some());
        assert!(engine.get_endpoint_for_deployment("time", &other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn controllers_are_assigned_round_robin() {
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let (engine, _) = engine(launcher.clone(), 10);
        for _ in 0..3 {
            engine.set_replicas("echo", &DeploymentKey::new(), "go", 1).unwrap();
        }
        settle().await;
        let ports: Vec<_> = launcher
            .configs
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.controller_endpoint.port())
            .collect();
        assert_eq!(ports, vec![Some(8892), Some(8893), Some(8892)]);
    }

    #[tokio::test]
    async fn unknown_module_or_deployment_is_an_error() {
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let (engine, _) = engine(launcher, 10);
        let key = DeploymentKey::new();
        assert!(matches!(
            engine.get_endpoint_for_deployment("echo", &key).await,
            Err(ScalingError::ModuleNotFound(_))
        ));
        engine.set_replicas("echo", &key, "go", 1).unwrap();
        assert!(matches!(
            engine.get_endpoint_for_deployment("echo", &DeploymentKey::new()).await,
            Err(ScalingError::DeploymentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn runtimeless_module_is_not_started() {
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let (engine, _) = engine(launcher.clone(), 10);
        let mut schema = module("bare");
        schema.runtime = None;
        engine
            .start_deployment(&CancellationToken::new(), "bare", &DeploymentKey::new(), &schema, false, false)
            .await
            .unwrap();
        settle().await;
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn dev_endpoint_is_passed_to_runner_once() {
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let (tx, rx) = mpsc::channel(4);
        let settings = LocalSettings::new("/tmp/ftl-cache", vec![Url::parse("http://127.0.0.1:8892").unwrap()]);
        let engine = LocalScaling::new(
            CancellationToken::new(),
            launcher.clone(),
            settings,
            Arc::new(MemoryStatus::new()),
            Some(rx),
        );
        let ctx = CancellationToken::new();
        engine.start(&ctx).await.unwrap();
        tx.send(LocalEndpoint {
            module: "echo".into(),
            endpoint: Url::parse("http://127.0.0.1:7000").unwrap(),
            language: "go".into(),
            debug_port: 4000,
            runner_info_file: Some(PathBuf::from("/tmp/echo.json")),
        })
        .await
        .unwrap();
        settle().await;

        let key = DeploymentKey::new();
        engine.set_replicas("echo", &key, "go", 1).unwrap();
        settle().await;
        assert_eq!(launcher.launches(), 1);
        let config = launcher.configs.lock().unwrap()[0].clone();
        assert_eq!(config.dev_endpoint.unwrap().port(), Some(7000));
        assert_eq!(config.debug_port, 4000);
        assert_eq!(config.dev_runner_info_file, Some(PathBuf::from("/tmp/echo.json")));
        ctx.cancel();
    }

    #[tokio::test]
    async fn debug_ports_are_written_to_launch_json() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("project.toml"), "").unwrap();
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let mut settings = LocalSettings::new(
            project.path().join("cache"),
            vec![Url::parse("http://127.0.0.1:8892").unwrap()],
        );
        settings.ide = Some(IdeIntegration::new(project.path()));
        let engine = LocalScaling::new(
            CancellationToken::new(),
            launcher.clone(),
            settings,
            Arc::new(MemoryStatus::new()),
            None,
        );
        let key = DeploymentKey::new();

        // Returns before the file is written; the write happens on the
        // blocking pool.
        engine.set_replicas("echo", &key, "go", 1).unwrap();

        let launch = project.path().join(".vscode").join("launch.json");
        let written = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let parsed = std::fs::read_to_string(&launch)
                    .ok()
                    .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok());
                if let Some(json) = parsed {
                    if json["configurations"][0]["name"] == "FTL GO - echo" {
                        return json;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        settle().await;

        let debug_port = launcher.configs.lock().unwrap()[0].debug_port;
        assert_ne!(debug_port, 0);
        assert_eq!(written["configurations"][0]["port"], debug_port);
    }

    #[tokio::test]
    async fn cancelled_engine_starts_nothing() {
        let launcher = FakeLauncher::new(Behaviour::RunUntilCancelled);
        let root = CancellationToken::new();
        let engine = LocalScaling::new(
            root.clone(),
            launcher.clone(),
            LocalSettings::new("/tmp/ftl-cache", vec![Url::parse("http://127.0.0.1:8892").unwrap()]),
            Arc::new(MemoryStatus::new()),
            None,
        );
        root.cancel();
        let key = DeploymentKey::new();
        engine.set_replicas("echo", &key, "go", 1).unwrap();
        settle().await;
        assert_eq!(launcher.launches(), 0);
        assert_eq!(engine.get_endpoint_for_deployment("echo", &key).await.unwrap(), None);
    }
}
