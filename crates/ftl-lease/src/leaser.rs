//! The lease store contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{LeaseError, LeaseResult};
use crate::key::Key;

/// Shortest TTL any store accepts.
pub const MIN_TTL: Duration = Duration::from_secs(5);

/// A held lease.
#[async_trait]
pub trait Lease: Send + Sync {
    /// Give the lease up. The lease's context is cancelled once this returns.
    async fn release(&self) -> LeaseResult<()>;
}

/// Current holder information for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseInfo {
    pub expiry: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl LeaseInfo {
    /// Decode the metadata into a concrete type.
    pub fn metadata_as<T: DeserializeOwned>(&self) -> LeaseResult<Option<T>> {
        self.metadata
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(LeaseError::from)
    }
}

#[async_trait]
pub trait Leaser: Send + Sync {
    /// Acquire the lease on `key`.
    ///
    /// Returns [`LeaseError::Conflict`] when another holder has it. The
    /// returned token is a child of `ctx` and is cancelled as soon as the
    /// lease can no longer be confirmed; holders observing it must stop
    /// acting as owner.
    async fn acquire_lease(
        &self,
        ctx: &CancellationToken,
        key: &Key,
        ttl: Duration,
        metadata: Option<serde_json::Value>,
    ) -> LeaseResult<(Arc<dyn Lease>, CancellationToken)>;

    /// Expiry and metadata of the live lease on `key`, or
    /// [`LeaseError::NotFound`].
    async fn get_lease_info(&self, key: &Key) -> LeaseResult<LeaseInfo>;
}

pub(crate) fn check_ttl(ttl: Duration) -> LeaseResult<()> {
    if ttl < MIN_TTL {
        return Err(LeaseError::InvalidArgument(format!(
            "lease TTL must be at least {}s, got {ttl:?}",
            MIN_TTL.as_secs()
        )));
    }
    Ok(())
}
