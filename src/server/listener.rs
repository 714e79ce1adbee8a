use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{Instrument, info};

use crate::config::Config;
use crate::context::ProxyContext;
use crate::http::connection::Connection;

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let ctx = Arc::new(ProxyContext::from_config(cfg)?);

    let listener = TcpListener::bind(&cfg.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.listen_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    serve(listener, ctx, cfg.server.max_workers).await
}

/// Accepts connections until the task is dropped. At most `max_workers`
/// connections are served at once; further clients wait in the backlog.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    max_workers: usize,
) -> anyhow::Result<()> {
    let workers = Arc::new(Semaphore::new(max_workers));
    let mut next_id = 0u64;

    loop {
        let permit = workers.clone().acquire_owned().await?;

        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        next_id += 1;
        let id = next_id;

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(error = %e, "Couldn't set TCP_NODELAY");
        }

        let ctx = ctx.clone();
        let span = tracing::info_span!("connection", id, %peer);

        tokio::spawn(
            async move {
                tracing::debug!("Accepted connection");

                if let Err(e) = Connection::new(id, socket, ctx).run().await {
                    tracing::warn!(error = %e, "Connection failed");
                }

                drop(permit);
            }
            .instrument(span),
        );
    }
}
