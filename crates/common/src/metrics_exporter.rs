//! `/metrics` HTTP endpoint serving [`global_metrics`] in Prometheus text format.

use std::io;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::metrics::global_metrics;

/// Bind `addr` and serve `/metrics` until the task is dropped or fails.
pub async fn run_metrics_exporter(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router())
        .await
        .map_err(io::Error::other)
}

/// Run the exporter in the background; bind errors surface through the handle.
pub fn spawn_metrics_exporter(addr: SocketAddr) -> JoinHandle<io::Result<()>> {
    tokio::spawn(run_metrics_exporter(addr))
}

fn router() -> Router {
    Router::new().route("/metrics", get(render))
}

async fn render() -> String {
    global_metrics().render_prometheus()
}
