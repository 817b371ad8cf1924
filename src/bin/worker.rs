//! Worker service binary

use gridmesh::cluster::{WorkerConfig, WorkerNode};
use std::collections::HashMap;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting gridmesh worker");

    // Load configuration from environment
    let hostname = std::env::var("BIND_HOST").unwrap_or_else(|_| "localhost".into());
    let port: u16 = std::env::var("BIND_PORT")
        .unwrap_or_else(|_| "8886".into())
        .parse()?;
    let node_id = std::env::var("NODE_ID").ok().filter(|id| !id.is_empty());

    let worker = WorkerNode::new(WorkerConfig {
        hostname,
        port,
        node_id,
    });

    if let Ok(timeout) = std::env::var("MASTER_TIMEOUT_SECS") {
        let accepted = timeout
            .parse()
            .map(|secs| worker.set_master_node_timeout(secs))
            .unwrap_or(false);
        if !accepted {
            error!("Rejected MASTER_TIMEOUT_SECS value {}", timeout);
        }
    }

    let addr = worker.start().await?;
    info!("Worker ready at {}", addr);

    // Optionally attach to a seed master right away; anything else the
    // worker needs arrives by mirroring that master's cluster view.
    if let (Ok(master_id), Ok(master_url)) = (
        std::env::var("SEED_MASTER_ID"),
        std::env::var("SEED_MASTER_URL"),
    ) {
        let mut body = HashMap::new();
        body.insert("NodeId".to_string(), master_id);
        body.insert("NodeUrl".to_string(), master_url);
        let response = gridmesh::net::RestClient::new()
            .post(
                &format!("{}/internal/worker/join", worker.node_url()),
                &body,
            )
            .await;
        if response.code >= 300 {
            error!("Seed master registration failed: {:?}", response.body);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    worker.shutdown().await;

    Ok(())
}
