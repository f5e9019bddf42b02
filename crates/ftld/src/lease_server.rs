use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ftl_lease::{LeaseServer, LeaseTable};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve the lease service on `bind` until `ctx` is cancelled.
pub async fn run(ctx: CancellationToken, bind: SocketAddr, sweep_interval: Duration) -> anyhow::Result<()> {
    let server = LeaseServer::new(Arc::new(LeaseTable::new()));

    let sweeper = server.clone();
    let sweep_ctx = ctx.clone();
    let sweep_handle = tokio::spawn(async move { sweeper.run_sweeper(sweep_interval, sweep_ctx).await });

    info!(%bind, "lease server listening");
    tonic::transport::Server::builder()
        .add_service(server.into_service())
        .serve_with_shutdown(bind, async move { ctx.cancelled().await })
        .await?;

    let _ = sweep_handle.await;
    info!("lease server stopped");
    Ok(())
}
