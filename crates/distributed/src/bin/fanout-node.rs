use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use fanout_common::NodeConfig;
use fanout_common::config::env_or_default;
use fanout_common::spawn_metrics_exporter;
use fanout_distributed::NodeService;
use fanout_distributed::grpc::{GrpcJobTransport, JobServiceServer, NodeJobService};
use fanout_execution::InMemoryExecutor;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Register every `*.arrow` IPC file in `dir` as a table named after the file.
fn load_tables(
    executor: &InMemoryExecutor,
    dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("arrow") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let rows = executor.load_ipc_file(name, &path)?;
        info!(table = name, rows, "table loaded");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::from_env()?;
    let bind: SocketAddr = env_or_default("FANOUT_NODE_BIND", "0.0.0.0:50071").parse()?;
    let peers = GrpcJobTransport::parse_peers(&env_or_default("FANOUT_NODE_PEERS", ""))?;
    let tables_dir = std::env::var("FANOUT_NODE_TABLES_DIR").ok();
    if let Ok(raw) = std::env::var("FANOUT_NODE_METRICS_BIND") {
        let metrics_bind: SocketAddr = raw.parse()?;
        spawn_metrics_exporter(metrics_bind);
        info!(%metrics_bind, "metrics exporter started");
    }

    let executor = Arc::new(InMemoryExecutor::new());
    if let Some(dir) = &tables_dir {
        load_tables(&executor, Path::new(dir))?;
    }
    let transport = Arc::new(GrpcJobTransport::new(peers));
    let node = NodeService::new(config.clone(), executor, transport);

    info!(
        node = %config.node_id,
        %bind,
        page_size_rows = config.page_size_rows,
        "fanout-node started"
    );
    Server::builder()
        .add_service(JobServiceServer::new(NodeJobService::new(node)))
        .serve(bind)
        .await?;
    Ok(())
}
