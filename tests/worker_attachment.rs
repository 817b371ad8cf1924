//! Worker attachment integration tests
//!
//! A real worker against real masters: attach through one master,
//! mirror the cluster view, and observe the in-cluster flag drop when
//! no master can confirm quorum.

use std::collections::HashMap;
use std::net::TcpListener;
use std::time::Duration;

use gridmesh::cluster::{MasterConfig, MasterNode, WorkerConfig, WorkerNode};
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

async fn wait_for<F: FnMut() -> bool>(deadline: Duration, mut predicate: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}

#[tokio::test]
async fn test_worker_attaches_and_mirrors_cluster() {
    let n1 = master("n1", free_port());
    let n2 = master("n2", free_port());
    n1.start().await.unwrap();
    n2.start().await.unwrap();

    let client = RestClient::new();
    let mut body = HashMap::new();
    body.insert("NodeId".to_string(), "n2".to_string());
    body.insert("NodeUrl".to_string(), n2.node_url().to_string());
    client
        .post(&format!("{}/internal/master/join", n1.node_url()), &body)
        .await;

    let worker = WorkerNode::new(WorkerConfig {
        hostname: "127.0.0.1".into(),
        port: free_port(),
        node_id: Some("w1".to_string()),
    });
    worker.start().await.unwrap();

    // Attach the worker through n2 only; n1 must arrive by mirroring.
    let mut body = HashMap::new();
    body.insert("NodeId".to_string(), "n2".to_string());
    body.insert("NodeUrl".to_string(), n2.node_url().to_string());
    let joined = client
        .post(
            &format!("{}/internal/worker/join", worker.node_url()),
            &body,
        )
        .await;
    assert_eq!(joined.code, 201);

    let attached = wait_for(Duration::from_secs(45), || {
        worker.is_in_cluster() && worker.known_masters().contains(&"n1".to_string())
    })
    .await;
    assert!(attached, "worker never attached and mirrored the cluster");
    assert_eq!(worker.connected_master().as_deref(), Some("n2"));

    // The heartbeat side effect: n2 sees the worker as attached.
    let seen = wait_for(Duration::from_secs(15), || {
        n2.connected_workers().contains(&"w1".to_string())
    })
    .await;
    assert!(seen, "master never recorded the worker heartbeat");

    // Worker status body mirrors both masters with fresh counters.
    let status = client
        .get(&format!("{}/internal/worker/status", worker.node_url()))
        .await;
    assert_eq!(status.body["InCluster"], "True");
    assert_eq!(status.body["ConnectedTo"], "n2");
    assert!(status.body.contains_key("n1"));

    n1.shutdown().await;
    n2.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_worker_leaves_cluster_when_quorum_gone() {
    let n1 = master("n1", free_port());
    n1.start().await.unwrap();

    let worker = WorkerNode::new(WorkerConfig {
        hostname: "127.0.0.1".into(),
        port: free_port(),
        node_id: Some("w1".to_string()),
    });
    worker.start().await.unwrap();

    let client = RestClient::new();
    let mut body = HashMap::new();
    body.insert("NodeId".to_string(), "n1".to_string());
    body.insert("NodeUrl".to_string(), n1.node_url().to_string());
    client
        .post(
            &format!("{}/internal/worker/join", worker.node_url()),
            &body,
        )
        .await;

    let attached = wait_for(Duration::from_secs(30), || worker.is_in_cluster()).await;
    assert!(attached, "worker never attached");

    // The only master disappears; the worker must notice within a few
    // loop passes and report itself out of the cluster.
    n1.shutdown().await;
    let detached = wait_for(Duration::from_secs(30), || !worker.is_in_cluster()).await;
    assert!(detached, "worker kept claiming cluster membership");

    let status = client
        .get(&format!("{}/internal/worker/status", worker.node_url()))
        .await;
    assert_eq!(status.body["InCluster"], "False");
    // Still round-robining over the one master it knows.
    assert_eq!(status.body["ConnectedTo"], "n1");

    worker.shutdown().await;
}
