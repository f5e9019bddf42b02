//! Both engines driven through the `RunnerScaling` trait object.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ftl_core::schema::{ModuleRuntime, RuntimeBase};
use ftl_core::{DeploymentKey, Module};
use ftl_scaling::RunnerScaling;
use ftl_scaling::k8s::objects::{
    CONFIG_MAP, CONTROLLER_DEPLOYMENT, DEPLOYMENT_TEMPLATE, SERVICE_ACCOUNT_TEMPLATE, SERVICE_TEMPLATE, resource_name,
};
use ftl_scaling::k8s::{FakeKube, KubeApi, KubeScaling, KubeSettings};
use ftl_scaling::local::{LaunchError, LocalScaling, LocalSettings, RunnerConfig, RunnerLauncher};
use ftl_status::{MemoryStatus, ModuleState};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use url::Url;

const DEPLOYMENT_YAML: &str = "\
apiVersion: apps/v1
kind: Deployment
spec:
  template:
    spec:
      containers:
        - name: runner
";
const SERVICE_YAML: &str = "\
apiVersion: v1
kind: Service
";
const SERVICE_ACCOUNT_YAML: &str = "\
apiVersion: v1
kind: ServiceAccount
";

/// Holds its runner until cancelled.
struct Parked;

#[async_trait]
impl RunnerLauncher for Parked {
    async fn launch(&self, ctx: CancellationToken, _config: RunnerConfig) -> Result<(), LaunchError> {
        ctx.cancelled().await;
        Err(LaunchError::Cancelled)
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

fn cluster() -> Arc<FakeKube> {
    let kube = FakeKube::new("ftl");
    kube.insert_deployment(Deployment {
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
                        image: Some("ftl0/ftl-controller:1.2.3".into()),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    });
    kube.insert_config_map(ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP.into()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([
            (DEPLOYMENT_TEMPLATE.to_string(), DEPLOYMENT_YAML.to_string()),
            (SERVICE_TEMPLATE.to_string(), SERVICE_YAML.to_string()),
            (SERVICE_ACCOUNT_TEMPLATE.to_string(), SERVICE_ACCOUNT_YAML.to_string()),
        ])),
        ..ConfigMap::default()
    });
    Arc::new(kube)
}

/// Start one deployment and return its endpoint.
async fn deploy(engine: &dyn RunnerScaling, ctx: &CancellationToken, key: &DeploymentKey) -> Url {
    engine.start(ctx).await.unwrap();
    engine
        .start_deployment(ctx, "echo", key, &module("echo"), false, false)
        .await
        .unwrap();
    engine
        .get_endpoint_for_deployment("echo", key)
        .await
        .unwrap()
        .expect("a running deployment has an endpoint")
}

#[tokio::test]
async fn kube_engine_serves_through_the_deployment_service() {
    let kube = cluster();
    let status = Arc::new(MemoryStatus::new());
    let api: Arc<dyn KubeApi> = kube.clone();
    let engine: Arc<dyn RunnerScaling> = Arc::new(KubeScaling::with_api(
        api,
        KubeSettings::new(Url::parse("http://ftl-controller:8892").unwrap()),
        status.clone(),
    ));
    let ctx = CancellationToken::new();
    let key = DeploymentKey::new();

    let endpoint = deploy(engine.as_ref(), &ctx, &key).await;
    let name = resource_name(&key);
    assert_eq!(endpoint.host_str(), Some(name.as_str()));
    assert_eq!(endpoint.port(), Some(8892));
    assert!(kube.service(&name).is_some());
    assert!(kube.deployment(&name).is_some());
    assert_eq!(status.get("echo"), Some(ModuleState::Deployed));

    engine.terminate_deployment(&ctx, "echo", &key).await.unwrap();
    ctx.cancel();
}

#[tokio::test]
async fn local_engine_serves_on_loopback_until_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancellationToken::new();
    let status = Arc::new(MemoryStatus::new());
    let engine: Arc<dyn RunnerScaling> = Arc::new(LocalScaling::new(
        ctx.clone(),
        Arc::new(Parked),
        LocalSettings::new(dir.path(), vec![Url::parse("http://127.0.0.1:8892").unwrap()]),
        status.clone(),
        None,
    ));
    let key = DeploymentKey::new();

    let endpoint = deploy(engine.as_ref(), &ctx, &key).await;
    assert_eq!(endpoint.host_str(), Some("127.0.0.1"));
    assert_ne!(endpoint.port(), Some(0));

    engine.terminate_deployment(&ctx, "echo", &key).await.unwrap();
    assert_eq!(engine.get_endpoint_for_deployment("echo", &key).await.unwrap(), None);
    assert_eq!(status.get("echo"), Some(ModuleState::Terminated));
    ctx.cancel();
}
