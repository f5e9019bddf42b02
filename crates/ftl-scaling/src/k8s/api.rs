//! The slice of the Kubernetes API the scaling engines use.
//!
//! Everything is scoped to one namespace. Getters return `None` for
//! missing objects; deletes of missing objects fail with
//! [`KubeError::NotFound`](crate::KubeError::NotFound) and callers decide
//! whether that matters.

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};

use super::istio::AuthorizationPolicy;
use crate::error::KubeResult;

#[async_trait]
pub trait KubeApi: Send + Sync {
    fn namespace(&self) -> &str;

    /// Whether the cluster serves `security.istio.io`.
    fn istio_available(&self) -> bool;

    async fn get_deployment(&self, name: &str) -> KubeResult<Option<Deployment>>;
    async fn list_deployments(&self, label_selector: &str) -> KubeResult<Vec<Deployment>>;
    async fn create_deployment(&self, deployment: &Deployment) -> KubeResult<Deployment>;
    /// Fails with `Conflict` if the object changed since it was read.
    async fn replace_deployment(&self, deployment: &Deployment) -> KubeResult<Deployment>;
    async fn delete_deployment(&self, name: &str) -> KubeResult<()>;

    /// Yields once per change to a deployment matching `label_selector`.
    async fn watch_deployments(&self, label_selector: &str) -> KubeResult<BoxStream<'static, ()>>;

    async fn get_service(&self, name: &str) -> KubeResult<Option<Service>>;
    async fn create_service(&self, service: &Service) -> KubeResult<Service>;
    async fn delete_service(&self, name: &str) -> KubeResult<()>;

    async fn get_service_account(&self, name: &str) -> KubeResult<Option<ServiceAccount>>;
    async fn create_service_account(&self, account: &ServiceAccount) -> KubeResult<ServiceAccount>;

    async fn get_config_map(&self, name: &str) -> KubeResult<Option<ConfigMap>>;

    async fn get_authorization_policy(&self, name: &str) -> KubeResult<Option<AuthorizationPolicy>>;
    async fn create_authorization_policy(
        &self,
        policy: &AuthorizationPolicy,
    ) -> KubeResult<AuthorizationPolicy>;
    async fn replace_authorization_policy(
        &self,
        policy: &AuthorizationPolicy,
    ) -> KubeResult<AuthorizationPolicy>;
}
