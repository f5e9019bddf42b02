//! Object conventions shared by the kube engine and the legacy provisioner:
//! names, labels, owner references, templates and deployment sync.

use std::collections::BTreeMap;

use ftl_core::DeploymentKey;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVar, Service, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::api::KubeApi;
use crate::error::{KubeError, ScalingError, ScalingResult};
use crate::image::{extract_base, extract_tag};
use crate::retry::{Retry, RetryError};

pub const CONTROLLER_DEPLOYMENT: &str = "ftl-controller";
pub const CONFIG_MAP: &str = "ftl-controller-deployment-config";
pub const DEPLOYMENT_TEMPLATE: &str = "deploymentTemplate";
pub const SERVICE_TEMPLATE: &str = "serviceTemplate";
pub const SERVICE_ACCOUNT_TEMPLATE: &str = "serviceAccountTemplate";

pub const APP_LABEL: &str = "app";
pub const MODULE_LABEL: &str = "ftl.dev/module";
pub const DEPLOYMENT_LABEL: &str = "ftl.dev/deployment";

/// Port runners serve on inside the cluster.
pub const RUNNER_PORT: u16 = 8892;

pub const ENV_DEPLOYMENT: &str = "FTL_DEPLOYMENT";
pub const ENV_ENDPOINT: &str = "FTL_ENDPOINT";

/// Kubernetes object name for a deployment key.
///
/// Object names must be lowercase DNS labels, so the textual key cannot be
/// used directly.
pub fn resource_name(key: &DeploymentKey) -> String {
    format!("dpl-{}", key.ulid().to_string().to_lowercase())
}

/// `app`, deployment and module labels.
pub fn add_labels(meta: &mut ObjectMeta, module: &str, name: &str) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(APP_LABEL.to_string(), name.to_string());
    labels.insert(DEPLOYMENT_LABEL.to_string(), name.to_string());
    labels.insert(MODULE_LABEL.to_string(), module.to_string());
}

pub fn app_selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

pub fn owner_reference(api_version: &str, kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        ..OwnerReference::default()
    }
}

pub fn object_name<'a>(meta: &'a ObjectMeta) -> &'a str {
    meta.name.as_deref().unwrap_or_default()
}

pub fn first_container(deployment: &Deployment) -> Option<&Container> {
    deployment.spec.as_ref()?.template.spec.as_ref()?.containers.first()
}

pub fn first_container_mut(deployment: &mut Deployment) -> Option<&mut Container> {
    deployment.spec.as_mut()?.template.spec.as_mut()?.containers.first_mut()
}

fn container_image(deployment: &Deployment) -> ScalingResult<&str> {
    first_container(deployment)
        .and_then(|c| c.image.as_deref())
        .ok_or_else(|| {
            let name = object_name(&deployment.metadata);
            KubeError::Invalid(format!("deployment {name} container image")).into()
        })
}

/// Object templates held in the controller's ConfigMap, as YAML.
#[derive(Debug, Clone)]
pub struct Templates {
    data: BTreeMap<String, String>,
}

impl Templates {
    pub fn new(config_map: ConfigMap) -> Self {
        Self {
            data: config_map.data.unwrap_or_default(),
        }
    }

    pub async fn load(api: &dyn KubeApi) -> ScalingResult<Self> {
        let config_map = api
            .get_config_map(CONFIG_MAP)
            .await?
            .ok_or_else(|| KubeError::NotFound(format!("configmap {CONFIG_MAP}")))?;
        Ok(Self::new(config_map))
    }

    fn decode<T: DeserializeOwned>(&self, template: &'static str) -> ScalingResult<T> {
        let yaml = self
            .data
            .get(template)
            .ok_or(ScalingError::MissingTemplate(template))?;
        serde_yaml::from_str(yaml).map_err(|source| ScalingError::Template { template, source })
    }

    pub fn deployment(&self) -> ScalingResult<Deployment> {
        self.decode(DEPLOYMENT_TEMPLATE)
    }

    pub fn service(&self) -> ScalingResult<Service> {
        self.decode(SERVICE_TEMPLATE)
    }

    pub fn service_account(&self) -> ScalingResult<ServiceAccount> {
        self.decode(SERVICE_ACCOUNT_TEMPLATE)
    }
}

/// What the engines need to know about the controller's own Deployment.
#[derive(Debug, Clone)]
pub struct Controller {
    pub uid: String,
    pub image: String,
    pub service_account: String,
}

impl Controller {
    pub async fn load(api: &dyn KubeApi) -> ScalingResult<Self> {
        let deployment = api
            .get_deployment(CONTROLLER_DEPLOYMENT)
            .await?
            .ok_or_else(|| KubeError::NotFound(format!("deployment {CONTROLLER_DEPLOYMENT}")))?;
        let image = container_image(&deployment)?.to_string();
        let service_account = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_else(|| "default".to_string());
        Ok(Self {
            uid: deployment.metadata.uid.unwrap_or_default(),
            image,
            service_account,
        })
    }
}

/// Get the deployment's Service, creating it from the template when absent.
///
/// The Service is the root owner of every other per-deployment object and
/// is itself owned by the controller's Deployment.
pub async fn ensure_service(
    api: &dyn KubeApi,
    templates: &Templates,
    controller: &Controller,
    name: &str,
    labels: impl FnOnce(&mut ObjectMeta),
) -> ScalingResult<Service> {
    if let Some(service) = api.get_service(name).await? {
        debug!(%name, "service already exists");
        return Ok(service);
    }
    let mut service = templates.service()?;
    service.metadata.name = Some(name.to_string());
    service.metadata.owner_references = Some(vec![owner_reference(
        "apps/v1",
        "Deployment",
        CONTROLLER_DEPLOYMENT,
        &controller.uid,
    )]);
    service.spec.get_or_insert_with(Default::default).selector = Some(app_selector(name));
    labels(&mut service.metadata);
    let service = api.create_service(&service).await?;
    debug!(%name, "created service");
    Ok(service)
}

/// Runner Deployment `name` from the template, owned by its Service and
/// running `image` as `service_account`. Labels are left to the caller.
pub fn runner_deployment(
    templates: &Templates,
    name: &str,
    service_uid: &str,
    service_account: &str,
    image: String,
) -> ScalingResult<Deployment> {
    let mut deployment = templates.deployment()?;
    deployment.metadata.name = Some(name.to_string());
    deployment.metadata.owner_references = Some(vec![owner_reference("v1", "Service", name, service_uid)]);
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.selector = LabelSelector {
        match_labels: Some(app_selector(name)),
        ..LabelSelector::default()
    };
    spec.template
        .spec
        .get_or_insert_with(Default::default)
        .service_account_name = Some(service_account.to_string());
    let container = first_container_mut(&mut deployment)
        .ok_or_else(|| KubeError::Invalid(format!("{DEPLOYMENT_TEMPLATE} container")))?;
    container.image = Some(image);
    Ok(deployment)
}

/// A single mutation of a Deployment, reapplied on every retry.
pub type DeploymentChange = Box<dyn Fn(&mut Deployment) + Send + Sync>;

fn set_env(deployment: &mut Deployment, name: &str, value: &str) {
    let Some(container) = first_container_mut(deployment) else {
        return;
    };
    let env = container.env.get_or_insert_with(Vec::new);
    let var = EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    };
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

fn env_change(deployment: &Deployment, name: &'static str, value: &str) -> Option<DeploymentChange> {
    let current = first_container(deployment)
        .and_then(|c| c.env.as_ref())
        .and_then(|env| env.iter().find(|e| e.name == name))
        .and_then(|e| e.value.as_deref());
    if current == Some(value) {
        return None;
    }
    let value = value.to_string();
    Some(Box::new(move |d: &mut Deployment| set_env(d, name, &value)))
}

/// Changes that bring `deployment` in line with the controller: runner
/// image tag, replica count and injected environment. Empty when nothing
/// differs.
pub fn sync_deployment(
    controller_image: &str,
    deployment: &Deployment,
    key: &DeploymentKey,
    replicas: i32,
    controller_endpoint: &str,
) -> ScalingResult<Vec<DeploymentChange>> {
    let mut changes: Vec<DeploymentChange> = Vec::new();

    let ours = extract_tag(controller_image)?;
    let image = container_image(deployment)?;
    if extract_tag(image)? != ours {
        // The controller was upgraded; runners follow.
        match extract_base(image) {
            Ok(base) => {
                let upgraded = format!("{base}:{ours}");
                changes.push(Box::new(move |d: &mut Deployment| {
                    if let Some(container) = first_container_mut(d) {
                        container.image = Some(upgraded.clone());
                    }
                }));
            }
            Err(err) => warn!(error = %err, "could not determine base image for runner"),
        }
    }

    let current = deployment.spec.as_ref().and_then(|s| s.replicas);
    if current != Some(replicas) {
        changes.push(Box::new(move |d: &mut Deployment| {
            d.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        }));
    }

    changes.extend(env_change(deployment, ENV_DEPLOYMENT, &key.to_string()));
    changes.extend(env_change(deployment, ENV_ENDPOINT, controller_endpoint));
    Ok(changes)
}

/// Re-read, mutate and replace `name` until the write is not rejected as a
/// conflict.
pub async fn update_deployment(
    api: &dyn KubeApi,
    retry: &Retry,
    name: &str,
    changes: &[DeploymentChange],
) -> ScalingResult<()> {
    let attempt = || async move {
        let mut deployment = api
            .get_deployment(name)
            .await?
            .ok_or_else(|| KubeError::NotFound(format!("deployment {name}")))?;
        for change in changes {
            change(&mut deployment);
        }
        api.replace_deployment(&deployment).await
    };
    match retry.run(attempt, KubeError::is_conflict).await {
        Ok(_) => Ok(()),
        Err(RetryError::Exhausted { attempts, .. }) => Err(ScalingError::UpdateConflicts {
            name: name.to_string(),
            attempts,
        }),
        Err(RetryError::Aborted(err)) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};

    use super::*;

    fn runner(image: &str, replicas: i32, env: &[(&str, &str)]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("dpl-echo".into()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "runner".into(),
                            image: Some(image.into()),
                            env: Some(
                                env.iter()
                                    .map(|(k, v)| EnvVar {
                                        name: k.to_string(),
                                        value: Some(v.to_string()),
                                        value_from: None,
                                    })
                                    .collect(),
                            ),
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

    #[test]
    fn in_sync_deployment_needs_no_changes() {
        let key = DeploymentKey::new();
        let id = key.to_string();
        let deployment = runner(
            "ftl0/ftl-runner:1.0.0",
            1,
            &[(ENV_DEPLOYMENT, id.as_str()), (ENV_ENDPOINT, "http://ftl:8892")],
        );
        let changes =
            sync_deployment("ftl0/ftl-controller:1.0.0", &deployment, &key, 1, "http://ftl:8892").unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn only_differing_fields_change() {
        let key = DeploymentKey::new();
        let id = key.to_string();
        let mut deployment = runner("ftl0/ftl-runner:1.0.0", 2, &[(ENV_DEPLOYMENT, id.as_str())]);
        let changes =
            sync_deployment("ftl0/ftl-controller:1.1.0", &deployment, &key, 1, "http://ftl:8892").unwrap();
        // image, replicas, FTL_ENDPOINT
        assert_eq!(changes.len(), 3);
        for change in &changes {
            change(&mut deployment);
        }
        let container = first_container(&deployment).unwrap();
        assert_eq!(container.image.as_deref(), Some("ftl0/ftl-runner:1.1.0"));
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));
        let env = container.env.as_ref().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[1].name, ENV_ENDPOINT);
        assert_eq!(env[1].value.as_deref(), Some("http://ftl:8892"));
    }

    #[test]
    fn stale_env_value_is_replaced_in_place() {
        let key = DeploymentKey::new();
        let id = key.to_string();
        let mut deployment = runner(
            "ftl0/ftl-runner:1.0.0",
            1,
            &[(ENV_ENDPOINT, "http://old:8892"), (ENV_DEPLOYMENT, id.as_str())],
        );
        let changes =
            sync_deployment("ftl0/ftl-controller:1.0.0", &deployment, &key, 1, "http://new:8892").unwrap();
        assert_eq!(changes.len(), 1);
        changes[0](&mut deployment);
        let env = first_container(&deployment).unwrap().env.clone().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0].value.as_deref(), Some("http://new:8892"));
    }

    #[test]
    fn resource_names_are_dns_labels() {
        let key = DeploymentKey::new();
        let name = resource_name(&key);
        assert!(name.starts_with("dpl-"));
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn templates_decode_yaml() {
        let config_map = ConfigMap {
            data: Some(BTreeMap::from([(
                SERVICE_TEMPLATE.to_string(),
                "apiVersion: v1\nkind: Service\nspec:\n  ports:\n    - port: 8892\n".to_string(),
            )])),
            ..ConfigMap::default()
        };
        let templates = Templates::new(config_map);
        let service = templates.service().unwrap();
        assert_eq!(service.spec.unwrap().ports.unwrap()[0].port, 8892);
        assert!(matches!(
            templates.deployment(),
            Err(ScalingError::MissingTemplate(DEPLOYMENT_TEMPLATE))
        ));
    }
}
