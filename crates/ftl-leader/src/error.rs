use ftl_lease::LeaseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("could not acquire lease for {key}: {source}")]
    Acquire {
        key: String,
        #[source]
        source: LeaseError,
    },

    #[error("could not create leader for {key}: {source}")]
    LeaderFactory {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not acquire or find lease for {key}")]
    NoLease { key: String },

    #[error("could not get lease for {key}: {source}")]
    LeaseInfo {
        key: String,
        #[source]
        source: LeaseError,
    },

    #[error("lease for {key} does not advertise a leader url")]
    MissingLeaderUrl { key: String },

    #[error("could not parse leader url for {key}: {url:?}")]
    InvalidLeaderUrl {
        key: String,
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("could not follow {key} leader at own url: {url}")]
    FollowSelf { key: String, url: String },

    #[error("could not generate follower for {key}: {source}")]
    FollowerFactory {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}
