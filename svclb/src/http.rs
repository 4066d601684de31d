use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State as AxumState;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::metrics::Metrics;

#[derive(Clone, Default)]
pub struct State {
    metrics: Metrics,
}

impl State {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        match prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry) {
            Ok(_) => buffer,
            Err(e) => {
                warn!(%e, "failed to encode metrics");
                String::new()
            }
        }
    }
}

pub async fn serve(addr: SocketAddr, state: Arc<State>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.metrics()
}

async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::metrics::{TableName, TableOp};

    #[tokio::test]
    async fn test_serve_metrics() -> crate::Result<()> {
        let metrics = Metrics::default();
        metrics
            .tables
            .count_write(TableName::Backend, TableOp::Delete, 1);
        let state = Arc::new(State::new(metrics));

        // bind first so the port is known, then hand the listener to axum
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(
            axum::serve(listener, router(state))
                .with_graceful_shutdown(shutdown(cancel.child_token()))
                .into_future(),
        );

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await?
            .text()
            .await?;
        assert!(body.contains("svclb_table_writes_total{table=\"Backend\",op=\"Delete\"} 1"));

        cancel.cancel();
        server
            .await
            .map_err(|e| crate::Error::Other(e.to_string()))??;
        Ok(())
    }
}
