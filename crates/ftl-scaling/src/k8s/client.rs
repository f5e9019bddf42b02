//! [`KubeApi`] backed by a real cluster.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::api::KubeApi;
use super::istio::AuthorizationPolicy;
use crate::error::{KubeError, KubeResult};

const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const ISTIO_GROUP: &str = "security.istio.io";

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    namespace: String,
    istio: bool,
}

impl KubeClient {
    /// Connect with in-cluster config or the local kubeconfig.
    ///
    /// The namespace is the pod's own when running in-cluster, otherwise
    /// the kubeconfig default. Istio is used when `allow_istio` is set and
    /// the cluster serves its security API group.
    pub async fn connect(allow_istio: bool) -> KubeResult<Self> {
        let client = Client::try_default().await?;
        let namespace = current_namespace(&client).await;
        let istio = allow_istio && has_api_group(&client, ISTIO_GROUP).await?;
        info!(%namespace, istio, "connected to kubernetes");
        Ok(Self::new(client, namespace, istio))
    }

    pub fn new(client: Client, namespace: impl Into<String>, istio: bool) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            istio,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

async fn current_namespace(client: &Client) -> String {
    match tokio::fs::read_to_string(NAMESPACE_FILE).await {
        Ok(namespace) if !namespace.trim().is_empty() => namespace.trim().to_string(),
        _ => client.default_namespace().to_string(),
    }
}

async fn has_api_group(client: &Client, group: &str) -> KubeResult<bool> {
    let groups = client.list_api_groups().await?;
    Ok(groups.groups.iter().any(|g| g.name == group))
}

async fn replace<K>(api: &Api<K>, object: &K) -> KubeResult<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = object
        .meta()
        .name
        .clone()
        .ok_or_else(|| KubeError::Invalid("unnamed object".into()))?;
    Ok(api.replace(&name, &PostParams::default(), object).await?)
}

async fn delete<K>(api: &Api<K>, name: &str) -> KubeResult<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::default()).await?;
    Ok(())
}

#[async_trait]
impl KubeApi for KubeClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn istio_available(&self) -> bool {
        self.istio
    }

    async fn get_deployment(&self, name: &str) -> KubeResult<Option<Deployment>> {
        Ok(self.api::<Deployment>().get_opt(name).await?)
    }

    async fn list_deployments(&self, label_selector: &str) -> KubeResult<Vec<Deployment>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api::<Deployment>().list(&params).await?.items)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> KubeResult<Deployment> {
        Ok(self
            .api::<Deployment>()
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> KubeResult<Deployment> {
        replace(&self.api(), deployment).await
    }

    async fn delete_deployment(&self, name: &str) -> KubeResult<()> {
        delete(&self.api::<Deployment>(), name).await
    }

    async fn watch_deployments(&self, label_selector: &str) -> KubeResult<BoxStream<'static, ()>> {
        let config = watcher::Config::default().labels(label_selector);
        let events = watcher(self.api::<Deployment>(), config)
            .default_backoff()
            .map(|event| {
                if let Err(err) = event {
                    debug!(error = %err, "deployment watch failed");
                }
            })
            .boxed();
        Ok(events)
    }

    async fn get_service(&self, name: &str) -> KubeResult<Option<Service>> {
        Ok(self.api::<Service>().get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> KubeResult<Service> {
        Ok(self
            .api::<Service>()
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn delete_service(&self, name: &str) -> KubeResult<()> {
        delete(&self.api::<Service>(), name).await
    }

    async fn get_service_account(&self, name: &str) -> KubeResult<Option<ServiceAccount>> {
        Ok(self.api::<ServiceAccount>().get_opt(name).await?)
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> KubeResult<ServiceAccount> {
        Ok(self
            .api::<ServiceAccount>()
            .create(&PostParams::default(), account)
            .await?)
    }

    async fn get_config_map(&self, name: &str) -> KubeResult<Option<ConfigMap>> {
        Ok(self.api::<ConfigMap>().get_opt(name).await?)
    }

    async fn get_authorization_policy(&self, name: &str) -> KubeResult<Option<AuthorizationPolicy>> {
        Ok(self.api::<AuthorizationPolicy>().get_opt(name).await?)
    }

    async fn create_authorization_policy(
        &self,
        policy: &AuthorizationPolicy,
    ) -> KubeResult<AuthorizationPolicy> {
        Ok(self
            .api::<AuthorizationPolicy>()
            .create(&PostParams::default(), policy)
            .await?)
    }

    async fn replace_authorization_policy(
        &self,
        policy: &AuthorizationPolicy,
    ) -> KubeResult<AuthorizationPolicy> {
        replace(&self.api(), policy).await
    }
}
