//! In-memory lease store for tests.
//!
//! Only presence is modelled: a lease is live until it is released or its
//! context is cancelled. A live lease reports an expiry of `now + ttl`, as
//! if it were being renewed continuously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LeaseError, LeaseResult};
use crate::key::Key;
use crate::leaser::{Lease, LeaseInfo, Leaser, check_ttl};

#[derive(Debug)]
struct Held {
    id: u64,
    ttl: Duration,
    metadata: Option<serde_json::Value>,
    ctx: CancellationToken,
}

type Table = Arc<Mutex<HashMap<Key, Held>>>;

#[derive(Debug, Default, Clone)]
pub struct FakeLeaser {
    leases: Table,
    next_id: Arc<AtomicU64>,
}

impl FakeLeaser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live leases.
    pub fn len(&self) -> usize {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_if_current(leases: &Table, key: &Key, id: u64) -> Option<Held> {
    let mut leases = leases.lock().unwrap_or_else(PoisonError::into_inner);
    if leases.get(key).is_some_and(|held| held.id == id) {
        leases.remove(key)
    } else {
        None
    }
}

#[async_trait]
impl Leaser for FakeLeaser {
    async fn acquire_lease(
        &self,
        ctx: &CancellationToken,
        key: &Key,
        ttl: Duration,
        metadata: Option<serde_json::Value>,
    ) -> LeaseResult<(Arc<dyn Lease>, CancellationToken)> {
        check_ttl(ttl)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lease_ctx = ctx.child_token();
        {
            let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
            if leases.contains_key(key) {
                return Err(LeaseError::Conflict(key.to_string()));
            }
            leases.insert(
                key.clone(),
                Held {
                    id,
                    ttl,
                    metadata,
                    ctx: lease_ctx.clone(),
                },
            );
        }
        debug!(%key, "fake lease acquired");

        // Drop the entry if the holder's context goes away.
        let leases = Arc::clone(&self.leases);
        let watched = lease_ctx.clone();
        let watched_key = key.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            remove_if_current(&leases, &watched_key, id);
        });

        let lease = FakeLease {
            leases: Arc::clone(&self.leases),
            key: key.clone(),
            id,
        };
        Ok((Arc::new(lease), lease_ctx))
    }

    async fn get_lease_info(&self, key: &Key) -> LeaseResult<LeaseInfo> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let held = leases
            .get(key)
            .filter(|held| !held.ctx.is_cancelled())
            .ok_or_else(|| LeaseError::NotFound(key.to_string()))?;
        let ttl = chrono::Duration::from_std(held.ttl)
            .map_err(|e| LeaseError::InvalidArgument(e.to_string()))?;
        Ok(LeaseInfo {
            expiry: Utc::now() + ttl,
            metadata: held.metadata.clone(),
        })
    }
}

struct FakeLease {
    leases: Table,
    key: Key,
    id: u64,
}

#[async_trait]
impl Lease for FakeLease {
    async fn release(&self) -> LeaseResult<()> {
        if let Some(held) = remove_if_current(&self.leases, &self.key, self.id) {
            held.ctx.cancel();
            debug!(key = %self.key, "fake lease released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_conflicts() {
        let leaser = FakeLeaser::new();
        let root = CancellationToken::new();
        let key = Key::system(["test"]);
        let (_lease, _ctx) = leaser
            .acquire_lease(&root, &key, Duration::from_secs(5), None)
            .await
            .unwrap();

        let err = leaser
            .acquire_lease(&root, &key, Duration::from_secs(5), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LeaseError::Conflict(_)));
    }

    #[tokio::test]
    async fn short_ttl_is_invalid() {
        let leaser = FakeLeaser::new();
        let err = leaser
            .acquire_lease(
                &CancellationToken::new(),
                &Key::system(["test"]),
                Duration::from_secs(1),
                None,
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LeaseError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn release_cancels_context_and_frees_key() {
        let leaser = FakeLeaser::new();
        let root = CancellationToken::new();
        let key = Key::system(["test"]);
        let metadata = serde_json::json!("http://localhost:1234");
        let (lease, ctx) = leaser
            .acquire_lease(&root, &key, Duration::from_secs(5), Some(metadata.clone()))
            .await
            .unwrap();

        let info = leaser.get_lease_info(&key).await.unwrap();
        assert_eq!(info.metadata, Some(metadata));
        assert!(info.expiry > Utc::now());

        lease.release().await.unwrap();
        assert!(ctx.is_cancelled());
        assert!(matches!(
            leaser.get_lease_info(&key).await,
            Err(LeaseError::NotFound(_))
        ));
        assert!(
            leaser
                .acquire_lease(&root, &key, Duration::from_secs(5), None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn parent_cancellation_drops_lease() {
        let leaser = FakeLeaser::new();
        let root = CancellationToken::new();
        let key = Key::module("echo", ["cron"]);
        let (_lease, ctx) = leaser
            .acquire_lease(&root, &key, Duration::from_secs(5), None)
            .await
            .unwrap();

        root.cancel();
        ctx.cancelled().await;
        assert!(leaser.get_lease_info(&key).await.is_err());
        for _ in 0..10 {
            if leaser.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(leaser.is_empty());
    }

    #[tokio::test]
    async fn stale_release_does_not_drop_new_holder() {
        let leaser = FakeLeaser::new();
        let root = CancellationToken::new();
        let key = Key::system(["test"]);
        let (first, _) = leaser
            .acquire_lease(&root, &key, Duration::from_secs(5), None)
            .await
            .unwrap();
        first.release().await.unwrap();
        let (_second, second_ctx) = leaser
            .acquire_lease(&root, &key, Duration::from_secs(5), None)
            .await
            .unwrap();

        first.release().await.unwrap();
        assert!(!second_ctx.is_cancelled());
        assert!(leaser.get_lease_info(&key).await.is_ok());
    }
}
