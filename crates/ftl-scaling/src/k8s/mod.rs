//! Kubernetes scaling: the engine, the legacy provisioner and the cluster
//! API they share.

mod api;
mod client;
mod engine;
mod fake;
pub mod istio;
pub mod objects;
mod provisioner;

pub use api::KubeApi;
pub use client::KubeClient;
pub use engine::{KubeScaling, KubeSettings};
pub use fake::FakeKube;
pub use istio::{AuthorizationPolicy, AuthorizationPolicySpec};
pub use provisioner::{DeploymentProvisioner, LEGACY_DEPLOYMENT_LABEL};
