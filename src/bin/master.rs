//! Master / resource-manager service binary

use gridmesh::cluster::{ManagerConfig, MasterConfig, MasterNode, ResourceManagerNode};
use gridmesh::net::RestClient;
use gridmesh::storage::StoreCredentials;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use axum::{routing::get, Router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting gridmesh master");

    // Load configuration from environment
    let hostname = std::env::var("BIND_HOST").unwrap_or_else(|_| "localhost".into());
    let port: u16 = std::env::var("BIND_PORT")
        .unwrap_or_else(|_| "9996".into())
        .parse()?;
    let node_id = std::env::var("NODE_ID").ok().filter(|id| !id.is_empty());

    let master_config = MasterConfig {
        hostname,
        port,
        node_id,
        ..Default::default()
    };

    // Consensus nodes carry object-store credentials; plain masters
    // only participate in membership.
    let credentials = std::env::var("S3_BUCKET").ok().map(|bucket| StoreCredentials {
        endpoint: std::env::var("S3_ENDPOINT").unwrap_or_else(|_| "http://localhost:9000".into()),
        bucket,
        prefix: std::env::var("S3_PREFIX").unwrap_or_else(|_| "gridmesh".into()),
        region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into()),
        access_key: std::env::var("AWS_ACCESS_KEY_ID")
            .or_else(|_| std::env::var("S3_ACCESS_KEY"))
            .unwrap_or_default(),
        secret_key: std::env::var("AWS_SECRET_ACCESS_KEY")
            .or_else(|_| std::env::var("S3_SECRET_KEY"))
            .unwrap_or_default(),
    });

    // Start metrics listener
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9100".into())
        .parse()?;
    tokio::spawn(async move {
        let app = Router::new().route(
            "/metrics",
            get(|| async { gridmesh::metrics::gather_node_metrics() }),
        );
        let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
        info!("Metrics listening on {}", addr);

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    warn!("Metrics server error: {}", e);
                }
            }
            Err(e) => warn!("Metrics bind failed: {}", e),
        }
    });

    enum Node {
        Manager(ResourceManagerNode),
        Plain(MasterNode),
    }

    let (node, node_url) = match credentials {
        Some(credentials) => {
            info!("Consensus enabled against {}", credentials.endpoint);
            let manager = ResourceManagerNode::new(
                ManagerConfig {
                    master: master_config,
                    ..Default::default()
                },
                credentials,
            )
            .await?;
            let addr = manager.start().await?;
            info!("Resource manager ready at {}", addr);
            let url = manager.master().node_url().to_string();
            (Node::Manager(manager), url)
        }
        None => {
            let master = MasterNode::new(master_config);
            let addr = master.start().await?;
            info!("Master ready at {}", addr);
            let url = master.node_url().to_string();
            (Node::Plain(master), url)
        }
    };

    // Optionally announce ourselves to a seed master
    if let Ok(seed_url) = std::env::var("SEED_MASTER_URL") {
        let (own_id, own_url) = match &node {
            Node::Manager(manager) => (manager.node_id().to_string(), node_url),
            Node::Plain(master) => (master.node_id().to_string(), node_url),
        };
        let mut body = HashMap::new();
        body.insert("NodeId".to_string(), own_id);
        body.insert("NodeUrl".to_string(), own_url);
        let response = RestClient::new()
            .post(&format!("{}/internal/master/join", seed_url), &body)
            .await;
        if response.code >= 300 {
            error!(
                "Seed join against {} failed: {:?}",
                seed_url, response.body
            );
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    match node {
        Node::Manager(manager) => manager.shutdown().await,
        Node::Plain(master) => master.shutdown().await,
    }

    Ok(())
}
