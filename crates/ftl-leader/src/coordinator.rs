//! Leader/follower coordination over a lease.
//!
//! The coordinator that holds the lease on its key builds a leader value
//! with the leader factory; the lease context is handed to the factory and
//! is cancelled when leadership is lost. Every other coordinator builds a
//! follower for the URL found in the lease metadata and keeps it until that
//! lease's expiry, after which it looks again.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ftl_lease::{Key, Lease, LeaseError, Leaser};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::CoordinatorError;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Called whenever this coordinator acquires the lease. The token is the
/// lease context and fires when leadership ends.
pub type LeaderFactory<P> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<anyhow::Result<P>> + Send + Sync>;

/// Called whenever a new leader URL is seen. The token is cancelled when
/// the follower is retired.
pub type FollowerFactory<P> =
    Arc<dyn Fn(CancellationToken, Url) -> BoxFuture<anyhow::Result<P>> + Send + Sync>;

/// Box a leader factory closure.
pub fn leader_factory<P, F, Fut>(f: F) -> LeaderFactory<P>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<P>> + Send + 'static,
{
    Arc::new(move |ctx| -> BoxFuture<anyhow::Result<P>> { Box::pin(f(ctx)) })
}

/// Box a follower factory closure.
pub fn follower_factory<P, F, Fut>(f: F) -> FollowerFactory<P>
where
    F: Fn(CancellationToken, Url) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<P>> + Send + 'static,
{
    Arc::new(move |ctx, url| -> BoxFuture<anyhow::Result<P>> { Box::pin(f(ctx, url)) })
}

const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

struct LeaderState<P> {
    value: P,
    lease: Arc<dyn Lease>,
    generation: u64,
}

struct FollowerState<P> {
    value: P,
    /// Expiry of the leader's lease when last checked.
    deadline: DateTime<Utc>,
    url: Url,
    ctx: CancellationToken,
}

enum State<P> {
    Unassigned,
    Leader(LeaderState<P>),
    Follower(FollowerState<P>),
}

struct Slot<P> {
    advertise: Url,
    state: State<P>,
    generation: u64,
}

impl<P> Slot<P> {
    fn retire_follower(&mut self) {
        if let State::Follower(follower) = &self.state {
            follower.ctx.cancel();
            self.state = State::Unassigned;
        }
    }
}

struct Inner<P> {
    /// Root of every lease and follower context. Captured at construction
    /// because callers of `get` may be short-lived.
    ctx: CancellationToken,
    key: Key,
    leaser: Arc<dyn Leaser>,
    ttl: Duration,
    leader_factory: LeaderFactory<P>,
    follower_factory: FollowerFactory<P>,
    slot: Mutex<Slot<P>>,
}

/// Assigns a single leader for `key` and lets everyone else follow it.
pub struct Coordinator<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for Coordinator<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> Coordinator<P>
where
    P: Clone + Send + Sync + 'static,
{
    /// Create a coordinator and start coordinating in the background.
    ///
    /// Must be called from within a tokio runtime. Background work stops
    /// when `ctx` is cancelled.
    pub fn new(
        ctx: CancellationToken,
        advertise: Url,
        key: Key,
        leaser: Arc<dyn Leaser>,
        ttl: Duration,
        leader_factory: LeaderFactory<P>,
        follower_factory: FollowerFactory<P>,
    ) -> Self {
        let coordinator = Self {
            inner: Arc::new(Inner {
                ctx,
                key,
                leaser,
                ttl,
                leader_factory,
                follower_factory,
                slot: Mutex::new(Slot {
                    advertise,
                    state: State::Unassigned,
                    generation: 0,
                }),
            }),
        };

        let proactive = coordinator.clone();
        tokio::spawn(async move {
            let _ = proactive.get().await;
        });
        tokio::spawn(coordinator.clone().reconcile());
        coordinator
    }

    pub fn key(&self) -> &Key {
        &self.inner.key
    }

    /// How often the background reconciler calls [`Coordinator::get`].
    pub fn reconcile_interval(&self) -> Duration {
        (self.inner.ttl / 2).max(MIN_RECONCILE_INTERVAL)
    }

    /// Return the leader value if this coordinator leads, otherwise a
    /// follower for the current leader.
    pub async fn get(&self) -> Result<P, CoordinatorError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;

        match &slot.state {
            State::Leader(leader) => return Ok(leader.value.clone()),
            State::Follower(follower) if Utc::now() < follower.deadline => {
                return Ok(follower.value.clone());
            }
            _ => {}
        }

        let metadata = serde_json::Value::String(slot.advertise.to_string());
        let acquired = inner
            .leaser
            .acquire_lease(&inner.ctx, &inner.key, inner.ttl, Some(metadata))
            .await;
        match acquired {
            Ok((lease, leader_ctx)) => {
                slot.retire_follower();
                let value = match (inner.leader_factory)(leader_ctx.clone()).await {
                    Ok(value) => value,
                    Err(source) => {
                        if let Err(err) = lease.release().await {
                            warn!(key = %inner.key, error = %err, "could not release lease after failing to create leader");
                        }
                        return Err(CoordinatorError::LeaderFactory {
                            key: inner.key.to_string(),
                            source,
                        });
                    }
                };
                slot.generation += 1;
                let generation = slot.generation;
                slot.state = State::Leader(LeaderState {
                    value: value.clone(),
                    lease,
                    generation,
                });
                tokio::spawn(self.clone().watch_leader(leader_ctx, generation));
                info!(key = %inner.key, advertise = %slot.advertise, "became leader");
                Ok(value)
            }
            Err(LeaseError::Conflict(_)) => self.follow(&mut slot).await,
            Err(source) => Err(CoordinatorError::Acquire {
                key: inner.key.to_string(),
                source,
            }),
        }
    }

    async fn follow(&self, slot: &mut Slot<P>) -> Result<P, CoordinatorError> {
        let inner = &self.inner;
        let key = || inner.key.to_string();

        let info = match inner.leaser.get_lease_info(&inner.key).await {
            Ok(info) => info,
            Err(LeaseError::NotFound(_)) => return Err(CoordinatorError::NoLease { key: key() }),
            Err(source) => return Err(CoordinatorError::LeaseInfo { key: key(), source }),
        };
        let leader_url = info
            .metadata_as::<String>()
            .map_err(|source| CoordinatorError::LeaseInfo { key: key(), source })?
            .filter(|url| !url.is_empty())
            .ok_or_else(|| CoordinatorError::MissingLeaderUrl { key: key() })?;
        let url = Url::parse(&leader_url).map_err(|source| CoordinatorError::InvalidLeaderUrl {
            key: key(),
            url: leader_url.clone(),
            source,
        })?;
        if url == slot.advertise {
            // Our own lease is still visible after we lost it. Following it
            // would route calls back to ourselves.
            return Err(CoordinatorError::FollowSelf {
                key: key(),
                url: leader_url,
            });
        }

        if let State::Follower(follower) = &mut slot.state {
            if follower.url == url {
                follower.deadline = info.expiry;
                return Ok(follower.value.clone());
            }
        }

        slot.retire_follower();
        let follower_ctx = inner.ctx.child_token();
        let value = match (inner.follower_factory)(follower_ctx.clone(), url.clone()).await {
            Ok(value) => value,
            Err(source) => {
                follower_ctx.cancel();
                return Err(CoordinatorError::FollowerFactory { key: key(), source });
            }
        };
        debug!(key = %inner.key, leader = %url, "following leader");
        slot.state = State::Follower(FollowerState {
            value: value.clone(),
            deadline: info.expiry,
            url,
            ctx: follower_ctx,
        });
        Ok(value)
    }

    /// Clear the leader once its lease context fires.
    async fn watch_leader(self, leader_ctx: CancellationToken, generation: u64) {
        leader_ctx.cancelled().await;
        let mut slot = self.inner.slot.lock().await;
        if matches!(&slot.state, State::Leader(leader) if leader.generation == generation) {
            warn!(key = %self.inner.key, "removing leader");
            slot.state = State::Unassigned;
        }
    }

    /// Keep followers from outliving their leader when nobody polls.
    async fn reconcile(self) {
        let interval = self.reconcile_interval();
        loop {
            tokio::select! {
                _ = self.inner.ctx.cancelled() => {
                    debug!(key = %self.inner.key, "coordinator shutting down");
                    let mut slot = self.inner.slot.lock().await;
                    slot.retire_follower();
                    if let State::Leader(leader) = &slot.state {
                        // Free the key for a successor before the TTL lapses.
                        if let Err(err) = leader.lease.release().await {
                            debug!(key = %self.inner.key, error = %err, "lease release on shutdown failed");
                        }
                    }
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.get().await {
                        debug!(key = %self.inner.key, error = %err, "coordination attempt failed");
                    }
                }
            }
        }
    }
}
