//! Lease store backed by the remote lease service.
//!
//! Each acquired lease owns one `AcquireLease` stream. The first request
//! acquires; the same request is resent every `ttl / 2` as a keep-alive
//! and must be acknowledged before the next tick. Any send, receive or
//! acknowledgement failure cancels the lease context and tears the
//! stream down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};
use url::Url;

use crate::error::{LeaseError, LeaseResult};
use crate::key::Key;
use crate::leaser::{Lease, LeaseInfo, Leaser, check_ttl};
use crate::proto;
use crate::proto::lease_service_client::LeaseServiceClient;

#[derive(Debug, Clone)]
pub struct GrpcLeaser {
    client: LeaseServiceClient<Channel>,
}

impl GrpcLeaser {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: LeaseServiceClient::new(channel),
        }
    }

    /// Connect eagerly, failing if the service is unreachable.
    pub async fn connect(endpoint: &Url) -> LeaseResult<Self> {
        let channel = Self::endpoint(endpoint)?
            .connect()
            .await
            .map_err(|e| LeaseError::Unavailable(e.to_string()))?;
        Ok(Self::new(channel))
    }

    /// Connect on first use.
    pub fn connect_lazy(endpoint: &Url) -> LeaseResult<Self> {
        Ok(Self::new(Self::endpoint(endpoint)?.connect_lazy()))
    }

    fn endpoint(endpoint: &Url) -> LeaseResult<Endpoint> {
        Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| LeaseError::InvalidArgument(format!("lease endpoint {endpoint}: {e}")))
    }
}

#[async_trait]
impl Leaser for GrpcLeaser {
    async fn acquire_lease(
        &self,
        ctx: &CancellationToken,
        key: &Key,
        ttl: Duration,
        metadata: Option<serde_json::Value>,
    ) -> LeaseResult<(Arc<dyn Lease>, CancellationToken)> {
        check_ttl(ttl)?;
        let metadata = metadata
            .map(|md| serde_json::to_string(&md))
            .transpose()?
            .unwrap_or_default();
        let request = proto::AcquireLeaseRequest {
            key: key.segments().to_vec(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            metadata,
        };

        let (tx, rx) = mpsc::channel(4);
        tx.send(request.clone())
            .await
            .map_err(|_| LeaseError::Unavailable("lease request channel closed".into()))?;

        let mut client = self.client.clone();
        let mut responses = client
            .acquire_lease(ReceiverStream::new(rx))
            .await?
            .into_inner();
        match responses.message().await? {
            Some(ack) => debug!(%key, expires_at = ack.expires_at_unix_ms, "lease acquired"),
            None => {
                return Err(LeaseError::Unavailable(format!(
                    "lease stream for {key} closed before acknowledging"
                )));
            }
        }

        let lease_ctx = ctx.child_token();
        let release = CancellationToken::new();
        let renewer = Renewer {
            key: key.clone(),
            ttl,
            request,
            tx,
            responses,
            lease_ctx: lease_ctx.clone(),
            release: release.clone(),
        };
        let task = tokio::spawn(renewer.run());

        let lease = GrpcLease {
            key: key.clone(),
            release,
            task: Mutex::new(Some(task)),
        };
        Ok((Arc::new(lease), lease_ctx))
    }

    async fn get_lease_info(&self, key: &Key) -> LeaseResult<LeaseInfo> {
        let mut client = self.client.clone();
        let response = client
            .get_lease_info(proto::GetLeaseInfoRequest {
                key: key.segments().to_vec(),
            })
            .await?
            .into_inner();
        let expiry = DateTime::<Utc>::from_timestamp_millis(response.expires_at_unix_ms)
            .ok_or_else(|| {
                LeaseError::Unavailable(format!(
                    "lease service returned invalid expiry {}",
                    response.expires_at_unix_ms
                ))
            })?;
        let metadata = if response.metadata.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&response.metadata)?)
        };
        Ok(LeaseInfo { expiry, metadata })
    }
}

struct Renewer {
    key: Key,
    ttl: Duration,
    request: proto::AcquireLeaseRequest,
    tx: mpsc::Sender<proto::AcquireLeaseRequest>,
    responses: Streaming<proto::AcquireLeaseResponse>,
    lease_ctx: CancellationToken,
    release: CancellationToken,
}

impl Renewer {
    async fn run(mut self) -> LeaseResult<()> {
        let interval = self.ttl / 2;
        let result = loop {
            tokio::select! {
                biased;
                _ = self.release.cancelled() => {
                    debug!(key = %self.key, "releasing lease");
                    break Ok(());
                }
                _ = self.lease_ctx.cancelled() => {
                    debug!(key = %self.key, "lease context cancelled");
                    break Ok(());
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.renew(interval).await {
                        warn!(key = %self.key, error = %err, "failed to renew lease");
                        break Err(err);
                    }
                }
            }
        };
        // Dropping the sender and response stream closes the RPC, which
        // releases the lease server-side.
        self.lease_ctx.cancel();
        result
    }

    async fn renew(&mut self, timeout: Duration) -> LeaseResult<()> {
        self.tx
            .send(self.request.clone())
            .await
            .map_err(|_| LeaseError::Unavailable("lease stream closed".into()))?;
        match tokio::time::timeout(timeout, self.responses.message()).await {
            Ok(Ok(Some(_))) => {
                debug!(key = %self.key, "lease renewed");
                Ok(())
            }
            Ok(Ok(None)) => Err(LeaseError::Unavailable("lease stream closed".into())),
            Ok(Err(status)) => Err(status.into()),
            Err(_) => Err(LeaseError::Unavailable(format!(
                "lease renewal not acknowledged within {timeout:?}"
            ))),
        }
    }
}

struct GrpcLease {
    key: Key,
    release: CancellationToken,
    task: Mutex<Option<JoinHandle<LeaseResult<()>>>>,
}

#[async_trait]
impl Lease for GrpcLease {
    async fn release(&self) -> LeaseResult<()> {
        self.release.cancel();
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) => Err(LeaseError::Unavailable(format!(
                "lease renewer for {} failed: {e}",
                self.key
            ))),
        }
    }
}
