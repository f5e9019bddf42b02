//! Lease service, server side.
//!
//! Leases live in a [`LeaseTable`]. A lease is bound to the stream that
//! acquired it: every message on the stream renews it, and the stream
//! ending (cleanly, with an error, or by going quiet past the TTL) drops
//! it. Expired entries are also evicted lazily on access and by
//! [`LeaseServer::run_sweeper`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::error::{LeaseError, LeaseResult};
use crate::key::Key;
use crate::leaser::check_ttl;
use crate::proto;
use crate::proto::lease_service_server::{LeaseService, LeaseServiceServer};

#[derive(Debug)]
struct Entry {
    holder: u64,
    ttl: Duration,
    deadline: Instant,
    expiry: DateTime<Utc>,
    metadata: String,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.deadline
    }
}

/// Snapshot of a live lease.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub expiry: DateTime<Utc>,
    /// JSON, empty when absent.
    pub metadata: String,
}

/// Authoritative lease state for one lease service instance.
#[derive(Debug, Default)]
pub struct LeaseTable {
    entries: Mutex<HashMap<Key, Entry>>,
    next_holder: AtomicU64,
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key` for a new holder. Fails with `Conflict` while another
    /// holder's lease is live.
    pub fn acquire(&self, key: &Key, ttl: Duration, metadata: String) -> LeaseResult<(u64, DateTime<Utc>)> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Err(LeaseError::Conflict(key.to_string()));
        }
        let holder = self.next_holder.fetch_add(1, Ordering::Relaxed);
        let expiry = expiry_after(ttl);
        entries.insert(
            key.clone(),
            Entry {
                holder,
                ttl,
                deadline: now + ttl,
                expiry,
                metadata,
            },
        );
        Ok((holder, expiry))
    }

    /// Extend `holder`'s lease by its TTL. Fails with `NotFound` once the
    /// lease has lapsed or passed to someone else.
    pub fn renew(&self, key: &Key, holder: u64) -> LeaseResult<DateTime<Utc>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key) {
            Some(entry) if entry.holder == holder && entry.is_live(now) => {
                entry.deadline = now + entry.ttl;
                entry.expiry = expiry_after(entry.ttl);
                Ok(entry.expiry)
            }
            _ => Err(LeaseError::NotFound(key.to_string())),
        }
    }

    /// Drop `holder`'s lease. A no-op if someone else holds `key` now.
    pub fn release(&self, key: &Key, holder: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|entry| entry.holder == holder) {
            entries.remove(key);
        }
    }

    pub fn info(&self, key: &Key) -> LeaseResult<TableInfo> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                return Ok(TableInfo {
                    expiry: entry.expiry,
                    metadata: entry.metadata.clone(),
                });
            }
            entries.remove(key);
        }
        Err(LeaseError::NotFound(key.to_string()))
    }

    /// Evict every lapsed lease, returning how many were dropped.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// gRPC implementation of the lease service.
#[derive(Debug, Clone)]
pub struct LeaseServer {
    table: Arc<LeaseTable>,
}

impl LeaseServer {
    pub fn new(table: Arc<LeaseTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<LeaseTable> {
        &self.table
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> LeaseServiceServer<Self> {
        LeaseServiceServer::new(self)
    }

    /// Periodically evict lapsed leases until `shutdown` fires.
    pub async fn run_sweeper(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let expired = self.table.expire();
                    if expired > 0 {
                        warn!(expired, "expired leases");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("lease sweeper shutting down");
                    break;
                }
            }
        }
    }
}

fn ack(expiry: DateTime<Utc>) -> proto::AcquireLeaseResponse {
    proto::AcquireLeaseResponse {
        expires_at_unix_ms: expiry.timestamp_millis(),
    }
}

/// Serve one held lease until its stream ends or goes quiet.
async fn hold(
    table: Arc<LeaseTable>,
    key: Key,
    holder: u64,
    ttl: Duration,
    mut inbound: Streaming<proto::AcquireLeaseRequest>,
    outbound: mpsc::Sender<Result<proto::AcquireLeaseResponse, Status>>,
) {
    loop {
        match tokio::time::timeout(ttl, inbound.message()).await {
            Ok(Ok(Some(_))) => match table.renew(&key, holder) {
                Ok(expiry) => {
                    if outbound.send(Ok(ack(expiry))).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%key, error = %err, "lease lost before renewal");
                    let _ = outbound.send(Err(err.into())).await;
                    break;
                }
            },
            Ok(Ok(None)) => {
                debug!(%key, "lease stream closed by holder");
                break;
            }
            Ok(Err(status)) => {
                debug!(%key, error = %status, "lease stream failed");
                break;
            }
            Err(_) => {
                warn!(%key, "lease holder missed its renewal window");
                break;
            }
        }
    }
    table.release(&key, holder);
    info!(%key, "lease released");
}

type AcquireStream =
    Pin<Box<dyn Stream<Item = Result<proto::AcquireLeaseResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl LeaseService for LeaseServer {
    type AcquireLeaseStream = AcquireStream;

    async fn acquire_lease(
        &self,
        request: Request<Streaming<proto::AcquireLeaseRequest>>,
    ) -> Result<Response<Self::AcquireLeaseStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("lease stream closed before acquire request"))?;
        let key = Key::from_segments(first.key)?;
        let ttl = Duration::from_millis(first.ttl_ms);
        let (holder, expiry) = self.table.acquire(&key, ttl, first.metadata)?;
        info!(%key, ?ttl, "lease acquired");

        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(ack(expiry)))
            .await
            .map_err(|_| Status::internal("lease response channel closed"))?;
        tokio::spawn(hold(Arc::clone(&self.table), key, holder, ttl, inbound, tx));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_lease_info(
        &self,
        request: Request<proto::GetLeaseInfoRequest>,
    ) -> Result<Response<proto::GetLeaseInfoResponse>, Status> {
        let key = Key::from_segments(request.into_inner().key)?;
        let info = self.table.info(&key)?;
        Ok(Response::new(proto::GetLeaseInfoResponse {
            expires_at_unix_ms: info.expiry.timestamp_millis(),
            metadata: info.metadata,
        }))
    }
}
