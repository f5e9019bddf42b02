//! Kubernetes scaling engine.
//!
//! Every deployment key becomes a Service (the root owner), a Deployment
//! owned by it, a per-module ServiceAccount and, with Istio, the
//! AuthorizationPolicies that let the controller and calling modules in.
//! Objects are created from the templates in the controller's ConfigMap.
//! Existing Deployments are only patched where they differ.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ftl_core::{DeploymentKey, Module, ReplicaPolicy};
use ftl_status::{ModuleState, SharedStatus};
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::api::KubeApi;
use super::client::KubeClient;
use super::istio::{AuthorizationPolicy, AuthorizationPolicySpec, service_account_principal};
use super::objects::{
    self, Controller, DEPLOYMENT_LABEL, MODULE_LABEL, RUNNER_PORT, Templates, add_labels, app_selector,
    owner_reference,
};
use crate::RunnerScaling;
use crate::error::{KubeError, ScalingError, ScalingResult};
use crate::image::runner_image;
use crate::retry::Retry;

/// Tuning for [`KubeScaling`].
#[derive(Debug, Clone)]
pub struct KubeSettings {
    /// Use Istio policies when the cluster supports them.
    pub istio: bool,
    /// Injected into runners as `FTL_ENDPOINT`.
    pub controller_endpoint: Url,
    pub replicas: ReplicaPolicy,
    /// Upper bound on waiting for a new Deployment to become ready.
    pub deploy_timeout: Duration,
    /// Re-check readiness at least this often while waiting.
    pub ready_poll: Duration,
    /// Delay before old Deployments of a module are purged.
    pub purge_delay: Duration,
    /// Delay before a terminated deployment's Service is deleted.
    pub terminate_delay: Duration,
    pub retry: Retry,
}

impl KubeSettings {
    pub fn new(controller_endpoint: Url) -> Self {
        Self {
            istio: true,
            controller_endpoint,
            replicas: ReplicaPolicy::default(),
            deploy_timeout: Duration::from_secs(5 * 60),
            ready_poll: Duration::from_secs(5),
            purge_delay: Duration::from_secs(20),
            terminate_delay: Duration::from_secs(10),
            retry: Retry::conflicts(),
        }
    }
}

struct Inner {
    api: OnceCell<Arc<dyn KubeApi>>,
    known: RwLock<HashSet<String>>,
    settings: KubeSettings,
    status: SharedStatus,
}

#[derive(Clone)]
pub struct KubeScaling {
    inner: Arc<Inner>,
}

enum Readiness {
    Ready,
    Pending,
    Failed(String),
}

fn readiness(deployment: &Deployment) -> Readiness {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = deployment.status.as_ref();
    let failure = status
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .find(|c| c.type_ == "ReplicaFailure" && c.status == "True");
    if let Some(condition) = failure {
        return Readiness::Failed(condition.message.clone().unwrap_or_default());
    }
    if status.and_then(|s| s.ready_replicas).unwrap_or(0) == desired {
        Readiness::Ready
    } else {
        Readiness::Pending
    }
}

impl KubeScaling {
    /// An engine that connects to the cluster on [`RunnerScaling::start`].
    pub fn new(settings: KubeSettings, status: SharedStatus) -> Self {
        Self {
            inner: Arc::new(Inner {
                api: OnceCell::new(),
                known: RwLock::new(HashSet::new()),
                settings,
                status,
            }),
        }
    }

    /// An engine using `api`; `start` becomes a no-op.
    pub fn with_api(api: Arc<dyn KubeApi>, settings: KubeSettings, status: SharedStatus) -> Self {
        let engine = Self::new(settings, status);
        // A fresh cell cannot already be set.
        let _ = engine.inner.api.set(api);
        engine
    }

    /// Whether `deployment` is currently tracked as wanted.
    pub fn is_known(&self, deployment: &DeploymentKey) -> bool {
        self.inner.is_known(&objects::resource_name(deployment))
    }
}

impl Inner {
    fn api(&self) -> ScalingResult<Arc<dyn KubeApi>> {
        self.api.get().cloned().ok_or(ScalingError::NotStarted)
    }

    fn is_known(&self, name: &str) -> bool {
        self.known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    fn remember(&self, name: &str) {
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }

    fn forget(&self, name: &str) {
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    async fn handle_existing(
        &self,
        api: &dyn KubeApi,
        deployment: &Deployment,
        key: &DeploymentKey,
        replicas: i32,
    ) -> ScalingResult<()> {
        let controller = Controller::load(api).await?;
        let changes = objects::sync_deployment(
            &controller.image,
            deployment,
            key,
            replicas,
            self.settings.controller_endpoint.as_str(),
        )?;
        if changes.is_empty() {
            return Ok(());
        }
        let name = objects::object_name(&deployment.metadata);
        debug!(%name, changes = changes.len(), "updating deployment");
        objects::update_deployment(api, &self.settings.retry, name, &changes).await
    }

    async fn handle_new(
        &self,
        api: &dyn KubeApi,
        module: &str,
        key: &DeploymentKey,
        name: &str,
        schema: &Module,
        replicas: i32,
    ) -> ScalingResult<()> {
        let templates = Templates::load(api).await?;
        let controller = Controller::load(api).await?;

        let service = objects::ensure_service(api, &templates, &controller, name, |meta| {
            add_labels(meta, module, name)
        })
        .await?;
        let service_uid = service.metadata.uid.clone().unwrap_or_default();

        // Istio needs a ServiceAccount per module; every module gets one.
        if api.get_service_account(module).await?.is_none() {
            let mut account = templates.service_account()?;
            account.metadata.name = Some(module.to_string());
            account
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(MODULE_LABEL.to_string(), module.to_string());
            api.create_service_account(&account).await?;
            debug!(%module, "created service account");
        }

        if self.settings.istio && api.istio_available() {
            self.sync_istio_policies(api, module, name, &service_uid, &controller, schema)
                .await?;
        }

        let base = schema.runtime.as_ref().and_then(|rt| rt.base.image.as_deref());
        let image = runner_image(&controller.image, base)?;

        let mut deployment = objects::runner_deployment(&templates, name, &service_uid, module, image)?;
        let changes = objects::sync_deployment(
            &controller.image,
            &deployment,
            key,
            replicas,
            self.settings.controller_endpoint.as_str(),
        )?;
        for change in &changes {
            change(&mut deployment);
        }
        add_labels(&mut deployment.metadata, module, name);
        if let Some(spec) = deployment.spec.as_mut() {
            add_labels(
                spec.template.metadata.get_or_insert_with(Default::default),
                module,
                name,
            );
        }

        api.create_deployment(&deployment).await?;
        info!(%module, %name, replicas, "created deployment");
        Ok(())
    }

    /// Ingress from the controller, plus one policy per module this module
    /// calls admitting this module's ServiceAccount.
    async fn sync_istio_policies(
        &self,
        api: &dyn KubeApi,
        module: &str,
        name: &str,
        service_uid: &str,
        controller: &Controller,
        schema: &Module,
    ) -> ScalingResult<()> {
        let namespace = api.namespace().to_string();
        let owner = owner_reference("v1", "Service", name, service_uid);

        let ingress = AuthorizationPolicySpec::allow(
            app_selector(name),
            service_account_principal(&namespace, &controller.service_account),
        );
        upsert_policy(api, name, ingress, |policy| {
            add_labels(&mut policy.metadata, module, name);
            policy.metadata.owner_references = Some(vec![owner.clone()]);
        })
        .await?;

        for callable in schema.callable_modules() {
            let policy_name = format!("{module}-{callable}");
            let spec = AuthorizationPolicySpec::allow(
                [(MODULE_LABEL.to_string(), callable.clone())].into(),
                service_account_principal(&namespace, module),
            );
            upsert_policy(api, &policy_name, spec, |policy| {
                policy
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(MODULE_LABEL.to_string(), module.to_string());
                policy.metadata.owner_references = Some(vec![owner.clone()]);
            })
            .await?;
        }
        Ok(())
    }

    async fn wait_for_ready(&self, api: &dyn KubeApi, name: &str) -> ScalingResult<()> {
        let mut changes: BoxStream<'static, ()> =
            api.watch_deployments(&format!("{DEPLOYMENT_LABEL}={name}")).await?;
        let deadline = tokio::time::sleep(self.settings.deploy_timeout);
        tokio::pin!(deadline);
        loop {
            let deployment = api
                .get_deployment(name)
                .await?
                .ok_or_else(|| ScalingError::DeploymentNotFound(name.to_string()))?;
            match readiness(&deployment) {
                Readiness::Ready => {
                    debug!(%name, "deployment is ready");
                    return Ok(());
                }
                Readiness::Failed(message) => {
                    return Err(ScalingError::ReplicaFailure {
                        deployment: name.to_string(),
                        message,
                    });
                }
                Readiness::Pending => {}
            }
            tokio::select! {
                _ = &mut deadline => {
                    return Err(ScalingError::NotReady { deployment: name.to_string() });
                }
                change = changes.next() => {
                    if change.is_none() {
                        // Watch ended; fall back to polling.
                        changes = futures::stream::pending().boxed();
                    }
                }
                _ = tokio::time::sleep(self.settings.ready_poll) => {}
            }
        }
    }

    /// Delete every Deployment of `module` other than `current`.
    async fn delete_old_deployments(&self, api: &dyn KubeApi, module: &str, current: &str) -> ScalingResult<()> {
        let deployments = api.list_deployments(&format!("{MODULE_LABEL}={module}")).await?;
        for deployment in deployments {
            let name = objects::object_name(&deployment.metadata);
            if name.is_empty() || name == current {
                continue;
            }
            debug!(%module, %name, "deleting old deployment");
            match api.delete_deployment(name).await {
                Ok(()) | Err(KubeError::NotFound(_)) => {}
                Err(err) => warn!(%module, %name, error = %err, "failed to delete old deployment"),
            }
        }
        Ok(())
    }
}

/// Create `name` or overwrite the spec of the existing policy.
pub(super) async fn upsert_policy(
    api: &dyn KubeApi,
    name: &str,
    spec: AuthorizationPolicySpec,
    decorate: impl Fn(&mut AuthorizationPolicy),
) -> ScalingResult<()> {
    match api.get_authorization_policy(name).await? {
        Some(mut policy) => {
            policy.spec = spec;
            decorate(&mut policy);
            api.replace_authorization_policy(&policy).await?;
            debug!(%name, "updated istio policy");
        }
        None => {
            let mut policy = AuthorizationPolicy::new(name, spec);
            policy.metadata.namespace = Some(api.namespace().to_string());
            decorate(&mut policy);
            api.create_authorization_policy(&policy).await?;
            debug!(%name, "created istio policy");
        }
    }
    Ok(())
}

#[async_trait]
impl RunnerScaling for KubeScaling {
    async fn start(&self, _ctx: &CancellationToken) -> ScalingResult<()> {
        let settings = &self.inner.settings;
        self.inner
            .api
            .get_or_try_init(|| async {
                let client = KubeClient::connect(settings.istio).await?;
                Ok::<_, ScalingError>(Arc::new(client) as Arc<dyn KubeApi>)
            })
            .await?;
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
        let inner = &self.inner;
        let api = inner.api()?;
        let name = objects::resource_name(deployment);
        let replicas = inner.settings.replicas.replicas_for(schema);
        debug!(%module, %deployment, %name, "starting deployment");

        if let Some(existing) = api.get_deployment(&name).await? {
            debug!(%module, %name, "deployment exists, syncing");
            inner.remember(&name);
            return inner.handle_existing(api.as_ref(), &existing, deployment, replicas).await;
        }
        if schema.runtime.is_none() {
            debug!(%module, "module has no runtime, nothing to deploy");
            return Ok(());
        }
        // A module change arrives as a new deployment; the previous one is
        // purged once this one is ready.
        inner.remember(&name);

        inner.status.set_module_state(module, ModuleState::Deploying);
        let created = async {
            inner.handle_new(api.as_ref(), module, deployment, &name, schema, replicas).await?;
            inner.wait_for_ready(api.as_ref(), &name).await
        };
        if let Err(err) = created.await {
            error!(%module, %name, error = %err, "deployment failed");
            inner.status.set_module_state(module, ModuleState::Failed);
            return Err(err);
        }
        inner.status.set_module_state(module, ModuleState::Deployed);

        // Runs to completion even if the caller's context ends first, for
        // example when leadership moves within the delay.
        let purge = Arc::clone(inner);
        let module = module.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(purge.settings.purge_delay).await;
            if let Err(err) = purge.delete_old_deployments(api.as_ref(), &module, &name).await {
                error!(%module, error = %err, "failed to delete old deployments");
            }
        });
        Ok(())
    }

    async fn terminate_deployment(
        &self,
        _ctx: &CancellationToken,
        module: &str,
        deployment: &DeploymentKey,
    ) -> ScalingResult<()> {
        let inner = &self.inner;
        let api = inner.api()?;
        let name = objects::resource_name(deployment);
        debug!(%module, %deployment, %name, "terminating deployment");
        if api.get_deployment(&name).await?.is_none() {
            return Ok(());
        }

        // Give every controller time to drop the runner from its routing
        // table before the Service goes away.
        let inner = Arc::clone(inner);
        let module = module.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(inner.settings.terminate_delay).await;
            inner.forget(&name);
            debug!(%module, %name, "deleting service");
            match api.delete_service(&name).await {
                Ok(()) | Err(KubeError::NotFound(_)) => {
                    inner.status.set_module_state(&module, ModuleState::Terminated);
                }
                Err(err) => error!(%module, %name, error = %err, "failed to delete service"),
            }
        });
        Ok(())
    }

    async fn get_endpoint_for_deployment(
        &self,
        _module: &str,
        deployment: &DeploymentKey,
    ) -> ScalingResult<Option<Url>> {
        let name = objects::resource_name(deployment);
        Ok(Some(Url::parse(&format!("http://{name}:{RUNNER_PORT}"))?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ftl_core::schema::{Decl, Metadata, ModuleRuntime, Ref, RuntimeBase, Verb};
    use ftl_status::MemoryStatus;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::k8s::fake::FakeKube;
    use crate::k8s::objects::{CONFIG_MAP, CONTROLLER_DEPLOYMENT, ENV_DEPLOYMENT, ENV_ENDPOINT, first_container};

    const DEPLOYMENT_YAML: &str = "\
apiVersion: apps/v1
kind: Deployment
spec:
  template:
    spec:
      containers:
        - name: runner
          ports:
            - containerPort: 8892
";
    const SERVICE_YAML: &str = "\
apiVersion: v1
kind: Service
spec:
  ports:
    - port: 8892
";
    const SERVICE_ACCOUNT_YAML: &str = "\
apiVersion: v1
kind: ServiceAccount
";

    fn controller(image: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(CONTROLLER_DEPLOYMENT.into()),
                uid: Some("controller-uid".into()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        service_account_name: Some("ftl-controller".into()),
                        containers: vec![Container {
                            name: "controller".into(),
                            image: Some(image.into()),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            status: None,
        }
    }

    fn cluster(istio: bool) -> Arc<FakeKube> {
        let kube = FakeKube::new("ftl").with_istio(istio);
        kube.insert_deployment(controller("ftl0/ftl-controller:1.2.3"));
        kube.insert_config_map(ConfigMap {
            metadata: ObjectMeta {
                name: Some(CONFIG_MAP.into()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([
                (objects::DEPLOYMENT_TEMPLATE.to_string(), DEPLOYMENT_YAML.to_string()),
                (objects::SERVICE_TEMPLATE.to_string(), SERVICE_YAML.to_string()),
                (objects::SERVICE_ACCOUNT_TEMPLATE.to_string(), SERVICE_ACCOUNT_YAML.to_string()),
            ])),
            ..ConfigMap::default()
        });
        Arc::new(kube)
    }

    fn settings() -> KubeSettings {
        KubeSettings::new(Url::parse("http://ftl-controller:8892").unwrap())
    }

    fn engine(kube: &Arc<FakeKube>) -> (KubeScaling, Arc<MemoryStatus>) {
        let status = Arc::new(MemoryStatus::new());
        let api: Arc<dyn KubeApi> = kube.clone();
        (KubeScaling::with_api(api, settings(), status.clone()), status)
    }

    fn module(name: &str, image: Option<&str>, calls: &[&str]) -> Module {
        let calls = calls
            .iter()
            .map(|m| Ref {
                module: m.to_string(),
                name: "verb".into(),
            })
            .collect();
        Module {
            name: name.into(),
            runtime: Some(ModuleRuntime {
                base: RuntimeBase {
                    language: "go".into(),
                    image: image.map(str::to_string),
                },
                scaling: None,
            }),
            decls: vec![Decl::Verb(Verb {
                name: "call".into(),
                metadata: vec![Metadata::Calls { calls }],
            })],
        }
    }

    #[tokio::test]
    async fn creates_service_account_and_deployment() {
        let kube = cluster(false);
        let (engine, status) = engine(&kube);
        let ctx = CancellationToken::new();
        let key = DeploymentKey::new();
        let name = objects::resource_name(&key);

        engine
            .start_deployment(&ctx, "echo", &key, &module("echo", None, &[]), false, false)
            .await
            .unwrap();

        let service = kube.service(&name).unwrap();
        let owner = &service.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "controller-uid");
        assert_eq!(service.spec.unwrap().selector.unwrap()["app"], name);

        let account = kube.service_account("echo").unwrap();
        assert_eq!(account.metadata.labels.unwrap()[MODULE_LABEL], "echo");

        let deployment = kube.deployment(&name).unwrap();
        assert_eq!(
            deployment.metadata.owner_references.as_ref().unwrap()[0].uid,
            format!("uid-{name}")
        );
        let labels = deployment.metadata.labels.clone().unwrap();
        assert_eq!(labels["app"], name);
        assert_eq!(labels[DEPLOYMENT_LABEL], name);
        assert_eq!(labels[MODULE_LABEL], "echo");
        let container = first_container(&deployment).unwrap();
        assert_eq!(container.image.as_deref(), Some("ftl0/ftl-runner:1.2.3"));
        let env: BTreeMap<_, _> = container
            .env
            .iter()
            .flatten()
            .map(|e| (e.name.as_str(), e.value.as_deref().unwrap_or_default()))
            .collect();
        assert_eq!(env[ENV_DEPLOYMENT], key.to_string());
        assert_eq!(env[ENV_ENDPOINT], "http://ftl-controller:8892/");
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.template.spec.unwrap().service_account_name.as_deref(), Some("echo"));

        assert!(engine.is_known(&key));
        assert_eq!(status.get("echo"), Some(ModuleState::Deployed));
        assert!(kube.policy_names().is_empty());
    }

    #[tokio::test]
    async fn custom_runner_image_uses_controller_tag() {
        let kube = cluster(false);
        let (engine, _) = engine(&kube);
        let key = DeploymentKey::new();
        engine
            .start_deployment(
                &CancellationToken::new(),
                "echo",
                &key,
                &module("echo", Some("other/custom-runner"), &[]),
                false,
                false,
            )
            .await
            .unwrap();
        let deployment = kube.deployment(&objects::resource_name(&key)).unwrap();
        assert_eq!(
            first_container(&deployment).unwrap().image.as_deref(),
            Some("other/custom-runner:1.2.3")
        );
    }

    #[tokio::test]
    async fn tagged_runner_image_is_rejected() {
        let kube = cluster(false);
        let (engine, status) = engine(&kube);
        let key = DeploymentKey::new();
        let err = engine
            .start_deployment(
                &CancellationToken::new(),
                "echo",
                &key,
                &module("echo", Some("other/custom-runner:latest"), &[]),
                false,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScalingError::Image(_)));
        assert!(kube.deployment(&objects::resource_name(&key)).is_none());
        assert_eq!(status.get("echo"), Some(ModuleState::Failed));
    }

    #[tokio::test]
    async fn istio_policies_cover_controller_and_callees() {
        let kube = cluster(true);
        let (engine, _) = engine(&kube);
        let key = DeploymentKey::new();
        let name = objects::resource_name(&key);
        engine
            .start_deployment(
                &CancellationToken::new(),
                "a",
                &key,
                &module("a", None, &["c", "b", "c"]),
                false,
                false,
            )
            .await
            .unwrap();

        let mut expected = vec!["a-b".to_string(), "a-c".to_string(), name.clone()];
        expected.sort();
        assert_eq!(kube.policy_names(), expected);

        let ingress = kube.policy(&name).unwrap();
        assert_eq!(ingress.spec.principals(), vec!["cluster.local/ns/ftl/sa/ftl-controller"]);
        assert_eq!(ingress.spec.selector.as_ref().unwrap().match_labels["app"], name);

        for callee in ["b", "c"] {
            let policy = kube.policy(&format!("a-{callee}")).unwrap();
            assert_eq!(policy.spec.principals(), vec!["cluster.local/ns/ftl/sa/a"]);
            assert_eq!(policy.spec.selector.as_ref().unwrap().match_labels[MODULE_LABEL], callee);
            assert_eq!(
                policy.metadata.owner_references.as_ref().unwrap()[0].uid,
                format!("uid-{name}")
            );
        }
    }

    #[tokio::test]
    async fn existing_deployment_is_only_patched_where_it_differs() {
        let kube = cluster(false);
        let (engine, _) = engine(&kube);
        let ctx = CancellationToken::new();
        let key = DeploymentKey::new();
        let name = objects::resource_name(&key);
        let schema = module("echo", None, &[]);

        engine.start_deployment(&ctx, "echo", &key, &schema, false, false).await.unwrap();
        assert_eq!(kube.replace_calls(), 0);

        // Nothing differs: no write.
        engine.start_deployment(&ctx, "echo", &key, &schema, false, false).await.unwrap();
        assert_eq!(kube.replace_calls(), 0);

        // Controller upgrade: runner image follows.
        kube.insert_deployment(controller("ftl0/ftl-controller:1.3.0"));
        engine.start_deployment(&ctx, "echo", &key, &schema, false, false).await.unwrap();
        assert_eq!(kube.replace_calls(), 1);
        let deployment = kube.deployment(&name).unwrap();
        assert_eq!(
            first_container(&deployment).unwrap().image.as_deref(),
            Some("ftl0/ftl-runner:1.3.0")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn update_retries_conflicts_then_gives_up() {
        let kube = cluster(false);
        let (engine, _) = engine(&kube);
        let ctx = CancellationToken::new();
        let key = DeploymentKey::new();
        let schema = module("echo", None, &[]);
        engine.start_deployment(&ctx, "echo", &key, &schema, false, false).await.unwrap();

        kube.insert_deployment(controller("ftl0/ftl-controller:2.0.0"));
        kube.fail_replaces(3);
        engine.start_deployment(&ctx, "echo", &key, &schema, false, false).await.unwrap();
        assert_eq!(kube.replace_calls(), 4);

        kube.insert_deployment(controller("ftl0/ftl-controller:3.0.0"));
        kube.fail_replaces(100);
        let err = engine
            .start_deployment(&ctx, "echo", &key, &schema, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ScalingError::UpdateConflicts { attempts: 10, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_is_an_error() {
        let kube = cluster(false);
        kube.set_auto_ready(false);
        let (engine, status) = engine(&kube);
        let key = DeploymentKey::new();
        let err = engine
            .start_deployment(&CancellationToken::new(), "echo", &key, &module("echo", None, &[]), false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ScalingError::NotReady { .. }));
        assert_eq!(err.to_string(), format!("deployment {} did not become ready in time", objects::resource_name(&key)));
        assert_eq!(status.get("echo"), Some(ModuleState::Failed));
    }

    #[tokio::test]
    async fn replica_failure_is_fatal() {
        let kube = cluster(false);
        kube.set_auto_ready(false);
        let (engine, _) = engine(&kube);
        let key = DeploymentKey::new();
        let name = objects::resource_name(&key);

        let failing = {
            let kube = kube.clone();
            let name = name.clone();
            async move {
                while kube.deployment(&name).is_none() {
                    tokio::task::yield_now().await;
                }
                kube.fail_replicas(&name, "quota exceeded");
            }
        };
        let ctx = CancellationToken::new();
        let schema = module("echo", None, &[]);
        let (result, ()) = tokio::join!(
            engine.start_deployment(&ctx, "echo", &key, &schema, false, false),
            failing,
        );
        match result {
            Err(ScalingError::ReplicaFailure { message, .. }) => assert_eq!(message, "quota exceeded"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn old_deployments_are_purged_after_delay() {
        let kube = cluster(false);
        let (engine, _) = engine(&kube);
        let ctx = CancellationToken::new();
        let schema = module("echo", None, &[]);
        let first = DeploymentKey::new();
        let second = DeploymentKey::new();

        engine.start_deployment(&ctx, "echo", &first, &schema, false, false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(21)).await;
        engine.start_deployment(&ctx, "echo", &second, &schema, false, false).await.unwrap();
        assert!(kube.deployment(&objects::resource_name(&first)).is_some());

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(kube.deployment(&objects::resource_name(&first)).is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(kube.deployment(&objects::resource_name(&first)).is_none());
        assert!(kube.deployment(&objects::resource_name(&second)).is_some());
        assert!(kube.deployment(CONTROLLER_DEPLOYMENT).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_deletes_service_after_delay() {
        let kube = cluster(false);
        let (engine, status) = engine(&kube);
        let ctx = CancellationToken::new();
        let key = DeploymentKey::new();
        let name = objects::resource_name(&key);
        engine
            .start_deployment(&ctx, "echo", &key, &module("echo", None, &[]), false, false)
            .await
            .unwrap();

        engine.terminate_deployment(&ctx, "echo", &key).await.unwrap();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(kube.service(&name).is_some());
        assert!(engine.is_known(&key));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(kube.service(&name).is_none());
        assert!(!engine.is_known(&key));
        assert_eq!(status.get("echo"), Some(ModuleState::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_outlives_the_caller_context() {
        let kube = cluster(false);
        let (engine, _) = engine(&kube);
        let ctx = CancellationToken::new();
        let schema = module("echo", None, &[]);
        let first = DeploymentKey::new();
        let second = DeploymentKey::new();

        engine.start_deployment(&ctx, "echo", &first, &schema, false, false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(21)).await;
        engine.start_deployment(&ctx, "echo", &second, &schema, false, false).await.unwrap();
        ctx.cancel();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(kube.deployment(&objects::resource_name(&first)).is_none());
        assert!(kube.deployment(&objects::resource_name(&second)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_outlives_the_caller_context() {
        let kube = cluster(false);
        let (engine, status) = engine(&kube);
        let ctx = CancellationToken::new();
        let key = DeploymentKey::new();
        let name = objects::resource_name(&key);
        engine
            .start_deployment(&ctx, "echo", &key, &module("echo", None, &[]), false, false)
            .await
            .unwrap();

        engine.terminate_deployment(&ctx, "echo", &key).await.unwrap();
        ctx.cancel();

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(kube.service(&name).is_none());
        assert!(!engine.is_known(&key));
        assert_eq!(status.get("echo"), Some(ModuleState::Terminated));
    }

    #[tokio::test]
    async fn runtimeless_module_is_not_tracked() {
        let kube = cluster(false);
        let (engine, status) = engine(&kube);
        let key = DeploymentKey::new();
        let mut schema = module("echo", None, &[]);
        schema.runtime = None;

        engine
            .start_deployment(&CancellationToken::new(), "echo", &key, &schema, false, false)
            .await
            .unwrap();
        assert!(!engine.is_known(&key));
        assert!(kube.deployment(&objects::resource_name(&key)).is_none());
        assert_eq!(status.get("echo"), None);
    }

    #[tokio::test]
    async fn terminate_unknown_deployment_is_a_no_op() {
        let kube = cluster(false);
        let (engine, _) = engine(&kube);
        engine
            .terminate_deployment(&CancellationToken::new(), "echo", &DeploymentKey::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn endpoint_is_the_service_address() {
        let kube = cluster(false);
        let (engine, _) = engine(&kube);
        let key = DeploymentKey::new();
        let url = engine.get_endpoint_for_deployment("echo", &key).await.unwrap().unwrap();
        assert_eq!(url.as_str(), format!("http://{}:8892/", objects::resource_name(&key)));
    }

    #[tokio::test]
    async fn operations_before_start_fail() {
        let engine = KubeScaling::new(settings(), Arc::new(MemoryStatus::new()));
        let err = engine
            .start_deployment(&CancellationToken::new(), "echo", &DeploymentKey::new(), &module("echo", None, &[]), false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ScalingError::NotStarted));
    }
}
