//! Schema-event driven provisioner, the predecessor of [`KubeScaling`].
//!
//! Consumes a stream of [`SchemaChange`]s rather than explicit start and
//! terminate calls. Objects carry the older `app` and `ftl-deployment`
//! labels, each deployment gets its own ServiceAccount, and Istio only
//! gets the ingress policy. Once the initial snapshot has been streamed,
//! every Deployment labelled `ftl-deployment` that no module points at is
//! deleted.
//!
//! [`KubeScaling`]: super::KubeScaling

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ftl_core::{ChangeType, DeploymentKey, Module, ReplicaPolicy, SchemaChange};
use ftl_status::{ModuleState, SharedStatus};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use super::api::KubeApi;
use super::engine::upsert_policy;
use super::istio::{AuthorizationPolicySpec, service_account_principal};
use super::objects::{self, APP_LABEL, Controller, Templates, app_selector, owner_reference};
use crate::error::{KubeError, ScalingResult};
use crate::image::runner_image;
use crate::retry::Retry;

pub const LEGACY_DEPLOYMENT_LABEL: &str = "ftl-deployment";

fn add_legacy_labels(meta: &mut ObjectMeta, name: &str) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(APP_LABEL.to_string(), name.to_string());
    labels.insert(LEGACY_DEPLOYMENT_LABEL.to_string(), name.to_string());
}

struct Inner {
    api: Arc<dyn KubeApi>,
    /// module -> resource name of its current deployment
    known_modules: Mutex<HashMap<String, String>>,
    controller_endpoint: Url,
    replicas: ReplicaPolicy,
    retry: Retry,
    remove_delay: Duration,
    status: SharedStatus,
}

#[derive(Clone)]
pub struct DeploymentProvisioner {
    inner: Arc<Inner>,
}

impl DeploymentProvisioner {
    pub fn new(api: Arc<dyn KubeApi>, controller_endpoint: Url, status: SharedStatus) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                known_modules: Mutex::new(HashMap::new()),
                controller_endpoint,
                replicas: ReplicaPolicy::MinReplicas { fallback: 1 },
                retry: Retry::conflicts(),
                remove_delay: Duration::from_secs(10),
                status,
            }),
        }
    }

    /// Resource name of the deployment `module` currently points at.
    pub fn known_deployment(&self, module: &str) -> Option<String> {
        self.inner.known().get(module).cloned()
    }

    /// Handle one schema change. Errors are logged and returned; a panic
    /// in the handler is logged and swallowed.
    pub async fn handle_schema_change(&self, change: &SchemaChange) -> ScalingResult<()> {
        let module = change.module_name.as_str();
        match AssertUnwindSafe(self.inner.handle(change)).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(%module, "handled schema change");
                Ok(())
            }
            Ok(Err(err)) => {
                error!(%module, error = %err, "failed to handle schema change");
                Err(err)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(%module, %message, "panic creating kube deployment");
                Ok(())
            }
        }
    }

    /// Apply changes from `changes` until it ends or `ctx` is cancelled.
    pub async fn run(&self, ctx: CancellationToken, mut changes: BoxStream<'static, SchemaChange>) {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                change = changes.next() => {
                    let Some(change) = change else {
                        info!("schema change stream ended");
                        return;
                    };
                    // Failures are already logged; the next change may succeed.
                    let _ = self.handle_schema_change(&change).await;
                }
            }
        }
    }
}

impl Inner {
    fn known(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.known_modules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle(self: &Arc<Self>, change: &SchemaChange) -> ScalingResult<()> {
        let result = self.apply(change).await;
        if !change.more {
            self.delete_missing_deployments().await;
        }
        result
    }

    async fn apply(self: &Arc<Self>, change: &SchemaChange) -> ScalingResult<()> {
        // Builtin modules have no deployment.
        let Some(key) = &change.deployment_key else {
            return Ok(());
        };
        let module = change.module_name.as_str();
        let name = objects::resource_name(key);
        debug!(%module, deployment = %key, "handling schema change");
        let existing = self.api.get_deployment(&name).await?;

        match change.change_type {
            // A changed module currently arrives as a new deployment key, so
            // both are handled as an add.
            ChangeType::Added | ChangeType::Changed => {
                self.known().insert(module.to_string(), name.clone());
                match existing {
                    Some(deployment) => self.handle_existing(&deployment, key, &change.schema).await,
                    None => self.handle_new(module, key, &name, &change.schema).await,
                }
            }
            ChangeType::Removed => {
                if existing.is_some() {
                    self.schedule_removal(module, name);
                }
                Ok(())
            }
        }
    }

    /// Not tied to any context: a removal scheduled by one leader still
    /// happens if leadership moves during the delay.
    fn schedule_removal(self: &Arc<Self>, module: &str, name: String) {
        let inner = Arc::clone(self);
        let module = module.to_string();
        tokio::spawn(async move {
            // Let every controller update its routing table first.
            tokio::time::sleep(inner.remove_delay).await;
            {
                let mut known = inner.known();
                if known.get(&module) == Some(&name) {
                    known.remove(&module);
                }
            }
            debug!(%module, %name, "deleting service");
            match inner.api.delete_service(&name).await {
                Ok(()) | Err(KubeError::NotFound(_)) => {
                    inner.status.set_module_state(&module, ModuleState::Terminated);
                }
                Err(err) => error!(%module, %name, error = %err, "failed to delete service"),
            }
        });
    }

    async fn handle_existing(
        &self,
        deployment: &Deployment,
        key: &DeploymentKey,
        schema: &Module,
    ) -> ScalingResult<()> {
        let api = self.api.as_ref();
        let controller = Controller::load(api).await?;
        let changes = objects::sync_deployment(
            &controller.image,
            deployment,
            key,
            self.replicas.replicas_for(schema),
            self.controller_endpoint.as_str(),
        )?;
        if changes.is_empty() {
            return Ok(());
        }
        let name = objects::object_name(&deployment.metadata);
        debug!(%name, "updating deployment");
        objects::update_deployment(api, &self.retry, name, &changes).await
    }

    async fn handle_new(
        &self,
        module: &str,
        key: &DeploymentKey,
        name: &str,
        schema: &Module,
    ) -> ScalingResult<()> {
        let Some(runtime) = &schema.runtime else {
            debug!(%module, "module has no runtime, nothing to deploy");
            return Ok(());
        };
        let api = self.api.as_ref();
        let templates = Templates::load(api).await?;
        let controller = Controller::load(api).await?;

        let service = objects::ensure_service(api, &templates, &controller, name, |meta| {
            add_legacy_labels(meta, name)
        })
        .await?;
        let service_uid = service.metadata.uid.clone().unwrap_or_default();
        let owner = owner_reference("v1", "Service", name, &service_uid);

        if api.get_service_account(name).await?.is_none() {
            let mut account = templates.service_account()?;
            account.metadata.name = Some(name.to_string());
            account
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(APP_LABEL.to_string(), name.to_string());
            account.metadata.owner_references = Some(vec![owner.clone()]);
            api.create_service_account(&account).await?;
            debug!(%name, "created service account");
        }

        if api.istio_available() {
            let ingress = AuthorizationPolicySpec::allow(
                app_selector(name),
                service_account_principal(api.namespace(), &controller.service_account),
            );
            upsert_policy(api, name, ingress, |policy| {
                policy.metadata.owner_references = Some(vec![owner.clone()]);
            })
            .await?;
        }

        let image = runner_image(&controller.image, runtime.base.image.as_deref())?;
        let mut deployment = objects::runner_deployment(&templates, name, &service_uid, name, image)?;
        let changes = objects::sync_deployment(
            &controller.image,
            &deployment,
            key,
            self.replicas.replicas_for(schema),
            self.controller_endpoint.as_str(),
        )?;
        for change in &changes {
            change(&mut deployment);
        }
        add_legacy_labels(&mut deployment.metadata, name);
        if let Some(spec) = deployment.spec.as_mut() {
            add_legacy_labels(spec.template.metadata.get_or_insert_with(Default::default), name);
        }
        api.create_deployment(&deployment).await?;
        info!(%module, %name, "created deployment");
        self.status.set_module_state(module, ModuleState::Deploying);
        Ok(())
    }

    /// Delete every labelled Deployment, and its Service, that no module
    /// points at.
    async fn delete_missing_deployments(&self) {
        let deployments = match self.api.list_deployments(LEGACY_DEPLOYMENT_LABEL).await {
            Ok(deployments) => deployments,
            Err(err) => {
                error!(error = %err, "failed to list deployments");
                return;
            }
        };
        let wanted: Vec<String> = self.known().values().cloned().collect();
        for deployment in deployments {
            let name = objects::object_name(&deployment.metadata);
            if name.is_empty() || wanted.iter().any(|w| w == name) {
                continue;
            }
            debug!(%name, "deleting deployment as it is not a known module");
            // Owner references cascade from the Service, but not every
            // Deployment has one yet.
            for result in [
                self.api.delete_service(name).await,
                self.api.delete_deployment(name).await,
            ] {
                match result {
                    Ok(()) | Err(KubeError::NotFound(_)) => {}
                    Err(err) => error!(%name, error = %err, "failed to delete deployment"),
                }
            }
        }
    }
}
