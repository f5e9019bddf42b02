use thiserror::Error;
use tonic::{Code, Status};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease not found: {0}")]
    NotFound(String),

    #[error("lease already held: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid lease metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

impl From<Status> for LeaseError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => LeaseError::NotFound(message),
            Code::ResourceExhausted | Code::AlreadyExists => LeaseError::Conflict(message),
            Code::InvalidArgument => LeaseError::InvalidArgument(message),
            code => LeaseError::Unavailable(format!("{code}: {message}")),
        }
    }
}

impl From<LeaseError> for Status {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::NotFound(msg) => Status::not_found(msg),
            LeaseError::Conflict(msg) => Status::resource_exhausted(msg),
            LeaseError::InvalidArgument(msg) => Status::invalid_argument(msg),
            LeaseError::Unavailable(msg) => Status::unavailable(msg),
            LeaseError::Metadata(e) => Status::invalid_argument(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_lease_maps_to_conflict() {
        let err = LeaseError::from(Status::resource_exhausted("held"));
        assert!(matches!(err, LeaseError::Conflict(_)));

        let status = Status::from(LeaseError::Conflict("/system/x".into()));
        assert_eq!(status.code(), Code::ResourceExhausted);
    }

    #[test]
    fn transport_failures_are_unavailable() {
        let err = LeaseError::from(Status::internal("boom"));
        assert!(matches!(err, LeaseError::Unavailable(_)));
    }
}
