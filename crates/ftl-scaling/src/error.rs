//! Scaling error types.

use thiserror::Error;

use crate::image::ImageError;

/// Errors from the cluster API, classified by how callers react to them.
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure or an object that already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("object {0} is missing required fields")]
    Invalid(String),

    #[error("kubernetes api error: {0}")]
    Api(#[source] Box<kube::Error>),
}

impl KubeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Conflict(_))
    }
}

impl From<kube::Error> for KubeError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => KubeError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 => KubeError::Conflict(resp.message.clone()),
            _ => KubeError::Api(Box::new(err)),
        }
    }
}

pub type KubeResult<T> = Result<T, KubeError>;

/// Errors that can occur while scaling deployments.
#[derive(Debug, Error)]
pub enum ScalingError {
    #[error("scaling engine has not been started")]
    NotStarted,

    #[error("deployment {deployment} did not become ready in time")]
    NotReady { deployment: String },

    #[error("deployment {deployment} is in error state: {message}")]
    ReplicaFailure { deployment: String, message: String },

    #[error("failed to update deployment {name}: {attempts} conflicts in a row")]
    UpdateConflicts { name: String, attempts: u32 },

    #[error("failed to decode {template} from config map: {source}")]
    Template {
        template: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config map has no {0}")]
    MissingTemplate(&'static str),

    #[error("module {0} not found")]
    ModuleNotFound(String),

    #[error("deployment {0} not found")]
    DeploymentNotFound(String),

    #[error("failed to allocate port: {0}")]
    Port(#[source] std::io::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Kube(#[from] KubeError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ScalingResult<T> = Result<T, ScalingError>;
