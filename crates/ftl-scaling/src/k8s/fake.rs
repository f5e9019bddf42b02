//! In-memory [`KubeApi`] for tests and dry runs.
//!
//! Objects live in maps keyed by name. Deployments can be marked ready on
//! write, and replace calls can be made to fail with conflicts to exercise
//! the retry paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use kube::Resource;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::api::KubeApi;
use super::istio::AuthorizationPolicy;
use crate::error::{KubeError, KubeResult};

#[derive(Default)]
struct Objects {
    deployments: BTreeMap<String, Deployment>,
    services: BTreeMap<String, Service>,
    service_accounts: BTreeMap<String, ServiceAccount>,
    config_maps: BTreeMap<String, ConfigMap>,
    policies: BTreeMap<String, AuthorizationPolicy>,
}

pub struct FakeKube {
    namespace: String,
    istio: bool,
    auto_ready: AtomicBool,
    pending_conflicts: AtomicU32,
    replace_calls: AtomicU32,
    objects: Mutex<Objects>,
    changes: broadcast::Sender<()>,
}

/// Whether every `key=value` (or bare `key`) term of `selector` matches.
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.and_then(|l| l.get(key)).is_some_and(|v| v == value),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

fn name_of<K: Resource>(object: &K) -> KubeResult<String> {
    object
        .meta()
        .name
        .clone()
        .ok_or_else(|| KubeError::Invalid("unnamed object".into()))
}

fn insert_new<K: Clone>(map: &mut BTreeMap<String, K>, name: String, object: K) -> KubeResult<K> {
    if map.contains_key(&name) {
        return Err(KubeError::Conflict(format!("{name} already exists")));
    }
    map.insert(name, object.clone());
    Ok(object)
}

fn mark_ready(deployment: &mut Deployment) {
    let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = deployment.status.get_or_insert_with(DeploymentStatus::default);
    status.replicas = Some(replicas);
    status.ready_replicas = Some(replicas);
}

impl FakeKube {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            namespace: namespace.into(),
            istio: false,
            auto_ready: AtomicBool::new(true),
            pending_conflicts: AtomicU32::new(0),
            replace_calls: AtomicU32::new(0),
            objects: Mutex::new(Objects::default()),
            changes,
        }
    }

    pub fn with_istio(mut self, istio: bool) -> Self {
        self.istio = istio;
        self
    }

    /// Report written deployments as fully ready. On by default.
    pub fn set_auto_ready(&self, ready: bool) {
        self.auto_ready.store(ready, Ordering::SeqCst);
    }

    /// Fail the next `n` deployment replaces with a conflict.
    pub fn fail_replaces(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn replace_calls(&self) -> u32 {
        self.replace_calls.load(Ordering::SeqCst)
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        // No watchers is fine.
        let _ = self.changes.send(());
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.objects().deployments.insert(name, deployment);
        self.notify();
    }

    pub fn insert_config_map(&self, config_map: ConfigMap) {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.objects().config_maps.insert(name, config_map);
    }

    /// Mark `name` ready (all replicas) or not ready (none).
    pub fn set_ready(&self, name: &str, ready: bool) {
        if let Some(deployment) = self.objects().deployments.get_mut(name) {
            if ready {
                mark_ready(deployment);
            } else {
                deployment.status.get_or_insert_with(DeploymentStatus::default).ready_replicas = Some(0);
            }
        }
        self.notify();
    }

    /// Add a `ReplicaFailure` condition to `name`.
    pub fn fail_replicas(&self, name: &str, message: &str) {
        if let Some(deployment) = self.objects().deployments.get_mut(name) {
            let status = deployment.status.get_or_insert_with(DeploymentStatus::default);
            status.conditions.get_or_insert_with(Vec::new).push(DeploymentCondition {
                type_: "ReplicaFailure".into(),
                status: "True".into(),
                message: Some(message.into()),
                ..DeploymentCondition::default()
            });
        }
        self.notify();
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.objects().deployments.get(name).cloned()
    }

    pub fn deployment_names(&self) -> Vec<String> {
        self.objects().deployments.keys().cloned().collect()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.objects().services.get(name).cloned()
    }

    pub fn service_account(&self, name: &str) -> Option<ServiceAccount> {
        self.objects().service_accounts.get(name).cloned()
    }

    pub fn policy(&self, name: &str) -> Option<AuthorizationPolicy> {
        self.objects().policies.get(name).cloned()
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.objects().policies.keys().cloned().collect()
    }
}

#[async_trait]
impl KubeApi for FakeKube {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn istio_available(&self) -> bool {
        self.istio
    }

    async fn get_deployment(&self, name: &str) -> KubeResult<Option<Deployment>> {
        Ok(self.deployment(name))
    }

    async fn list_deployments(&self, label_selector: &str) -> KubeResult<Vec<Deployment>> {
        Ok(self
            .objects()
            .deployments
            .values()
            .filter(|d| matches_selector(d.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> KubeResult<Deployment> {
        let name = name_of(deployment)?;
        let mut deployment = deployment.clone();
        if self.auto_ready.load(Ordering::SeqCst) {
            mark_ready(&mut deployment);
        }
        let created = insert_new(&mut self.objects().deployments, name, deployment)?;
        self.notify();
        Ok(created)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> KubeResult<Deployment> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let name = name_of(deployment)?;
        let conflict = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            return Err(KubeError::Conflict(format!("deployment {name} was modified")));
        }
        let mut deployment = deployment.clone();
        if self.auto_ready.load(Ordering::SeqCst) {
            mark_ready(&mut deployment);
        }
        {
            let mut objects = self.objects();
            let Some(slot) = objects.deployments.get_mut(&name) else {
                return Err(KubeError::NotFound(format!("deployment {name}")));
            };
            *slot = deployment.clone();
        }
        self.notify();
        Ok(deployment)
    }

    async fn delete_deployment(&self, name: &str) -> KubeResult<()> {
        let removed = self.objects().deployments.remove(name);
        self.notify();
        removed
            .map(|_| ())
            .ok_or_else(|| KubeError::NotFound(format!("deployment {name}")))
    }

    async fn watch_deployments(&self, _label_selector: &str) -> KubeResult<BoxStream<'static, ()>> {
        Ok(BroadcastStream::new(self.changes.subscribe()).map(|_| ()).boxed())
    }

    async fn get_service(&self, name: &str) -> KubeResult<Option<Service>> {
        Ok(self.service(name))
    }

    async fn create_service(&self, service: &Service) -> KubeResult<Service> {
        let name = name_of(service)?;
        let mut service = service.clone();
        service.metadata.uid = Some(format!("uid-{name}"));
        insert_new(&mut self.objects().services, name, service)
    }

    async fn delete_service(&self, name: &str) -> KubeResult<()> {
        self.objects()
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KubeError::NotFound(format!("service {name}")))
    }

    async fn get_service_account(&self, name: &str) -> KubeResult<Option<ServiceAccount>> {
        Ok(self.service_account(name))
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> KubeResult<ServiceAccount> {
        let name = name_of(account)?;
        insert_new(&mut self.objects().service_accounts, name, account.clone())
    }

    async fn get_config_map(&self, name: &str) -> KubeResult<Option<ConfigMap>> {
        Ok(self.objects().config_maps.get(name).cloned())
    }

    async fn get_authorization_policy(&self, name: &str) -> KubeResult<Option<AuthorizationPolicy>> {
        Ok(self.policy(name))
    }

    async fn create_authorization_policy(
        &self,
        policy: &AuthorizationPolicy,
    ) -> KubeResult<AuthorizationPolicy> {
        let name = name_of(policy)?;
        insert_new(&mut self.objects().policies, name, policy.clone())
    }

    async fn replace_authorization_policy(
        &self,
        policy: &AuthorizationPolicy,
    ) -> KubeResult<AuthorizationPolicy> {
        let name = name_of(policy)?;
        let mut objects = self.objects();
        let Some(slot) = objects.policies.get_mut(&name) else {
            return Err(KubeError::NotFound(format!("authorization policy {name}")));
        };
        *slot = policy.clone();
        Ok(policy.clone())
    }
}
