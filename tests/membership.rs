//! Master membership integration tests
//!
//! Real nodes on ephemeral ports with their loops running: bootstrap,
//! mutual discovery, failure visibility, and the departed-node ledger.

use std::collections::HashMap;
use std::net::TcpListener;
use std::time::Duration;

use gridmesh::cluster::{MasterConfig, MasterNode};
use gridmesh::net::RestClient;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("no free port")
}

fn master(id: &str, port: u16) -> MasterNode {
    MasterNode::new(MasterConfig {
        hostname: "127.0.0.1".into(),
        port,
        node_id: Some(id.to_string()),
        ..Default::default()
    })
}

async fn cluster_status(client: &RestClient, url: &str) -> HashMap<String, String> {
    client.get(&format!("{url}/cluster/status")).await.body
}

/// Poll until the predicate holds or the deadline passes
async fn wait_until<F>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> futures::future::BoxFuture<'static, bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}

#[tokio::test]
async fn test_single_master_bootstrap() {
    let node = master("n1", free_port());
    node.start().await.unwrap();

    let client = RestClient::new();
    let status = cluster_status(&client, node.node_url()).await;
    assert_eq!(status["n1"], "SelfInstance");
    assert_eq!(status["QuorumMet"], "True");
    assert_eq!(status["ClusterSize"], "1/1");

    node.shutdown().await;
}

#[tokio::test]
async fn test_two_masters_discover_each_other() {
    let n1 = master("n1", free_port());
    let n2 = master("n2", free_port());
    n1.start().await.unwrap();
    n2.start().await.unwrap();

    let client = RestClient::new();

    // Tell n1 about n2; n1 polls it, notices it is unknown there, and
    // asks to be added, completing the mesh without touching n2.
    let mut body = HashMap::new();
    body.insert("NodeId".to_string(), "n2".to_string());
    body.insert("NodeUrl".to_string(), n2.node_url().to_string());
    let joined = client
        .post(&format!("{}/internal/master/join", n1.node_url()), &body)
        .await;
    assert_eq!(joined.code, 201);

    let meshed = wait_until(Duration::from_secs(30), || {
        let client = RestClient::new();
        let n1_url = n1.node_url().to_string();
        let n2_url = n2.node_url().to_string();
        Box::pin(async move {
            let first = cluster_status(&client, &n1_url).await;
            let second = cluster_status(&client, &n2_url).await;
            first.get("n2").map(String::as_str) == Some("Connected")
                && second.get("n1").map(String::as_str) == Some("Connected")
                && first.get("ClusterSize").map(String::as_str) == Some("2/2")
        })
    })
    .await;
    assert!(meshed, "masters never finished mutual discovery");

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn test_failure_is_visible_and_quorum_tracks_it() {
    let n1 = master("n1", free_port());
    let n2 = master("n2", free_port());
    let n3 = master("n3", free_port());
    n1.start().await.unwrap();
    n2.start().await.unwrap();
    n3.start().await.unwrap();

    let client = RestClient::new();
    for peer in [&n2, &n3] {
        let mut body = HashMap::new();
        body.insert("NodeId".to_string(), peer.node_id().to_string());
        body.insert("NodeUrl".to_string(), peer.node_url().to_string());
        client
            .post(&format!("{}/internal/master/join", n1.node_url()), &body)
            .await;
    }

    let meshed = wait_until(Duration::from_secs(45), || {
        let client = RestClient::new();
        let n1_url = n1.node_url().to_string();
        Box::pin(async move {
            let status = cluster_status(&client, &n1_url).await;
            status.get("ClusterSize").map(String::as_str) == Some("3/3")
        })
    })
    .await;
    assert!(meshed, "three-node mesh never formed");

    // One node dies: visible as NotConnected, quorum holds at 2 of 3.
    n2.shutdown().await;
    let degraded = wait_until(Duration::from_secs(30), || {
        let client = RestClient::new();
        let n1_url = n1.node_url().to_string();
        Box::pin(async move {
            let status = cluster_status(&client, &n1_url).await;
            status.get("n2").map(String::as_str) == Some("NotConnected")
                && status.get("ClusterSize").map(String::as_str) == Some("2/3")
                && status.get("QuorumMet").map(String::as_str) == Some("True")
        })
    })
    .await;
    assert!(degraded, "n2 failure never became visible");

    // The second death drops quorum.
    n3.shutdown().await;
    let minority = wait_until(Duration::from_secs(30), || {
        let client = RestClient::new();
        let n1_url = n1.node_url().to_string();
        Box::pin(async move {
            let status = cluster_status(&client, &n1_url).await;
            status.get("ClusterSize").map(String::as_str) == Some("1/3")
                && status.get("QuorumMet").map(String::as_str) == Some("False")
        })
    })
    .await;
    assert!(minority, "quorum loss never became visible");

    n1.shutdown().await;
}

#[tokio::test]
async fn test_leave_ledger_suppresses_rediscovery() {
    let n1 = master("n1", free_port());
    let n2 = master("n2", free_port());
    let n3 = master("n3", free_port());
    n1.start().await.unwrap();
    n2.start().await.unwrap();
    n3.start().await.unwrap();

    let client = RestClient::new();
    for peer in [&n2, &n3] {
        let mut body = HashMap::new();
        body.insert("NodeId".to_string(), peer.node_id().to_string());
        body.insert("NodeUrl".to_string(), peer.node_url().to_string());
        client
            .post(&format!("{}/internal/master/join", n1.node_url()), &body)
            .await;
    }
    let meshed = wait_until(Duration::from_secs(45), || {
        let client = RestClient::new();
        let n1_url = n1.node_url().to_string();
        Box::pin(async move {
            cluster_status(&client, &n1_url)
                .await
                .get("ClusterSize")
                .map(String::as_str)
                == Some("3/3")
        })
    })
    .await;
    assert!(meshed);

    // Stop n2 first so it cannot re-join on its own, then remove it
    // formally from the two survivors.
    n2.shutdown().await;
    for survivor in [&n1, &n3] {
        let mut body = HashMap::new();
        body.insert("NodeId".to_string(), "n2".to_string());
        let removed = client
            .post(
                &format!("{}/internal/master/leave", survivor.node_url()),
                &body,
            )
            .await;
        assert_eq!(removed.code, 202);
    }

    // n3 still lists n2 briefly; the ledger must keep n1 from taking
    // the advertisement. Watch several poll rounds.
    tokio::time::sleep(Duration::from_secs(12)).await;
    let status = cluster_status(&client, n1.node_url()).await;
    assert!(!status.contains_key("n2"), "departed n2 was revived: {status:?}");
    assert_eq!(status["ClusterSize"], "2/2");

    n1.shutdown().await;
    n3.shutdown().await;
}
