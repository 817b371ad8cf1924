//! Node runtime plumbing
//!
//! A gridmesh node owns one REST listener and several periodic loops,
//! and all of them wind down together: shutdown fires the node's stop
//! signal, and every loop and the listener exit at their next
//! suspension point.

use tokio::sync::broadcast;

/// One-shot stop signal shared by a node's listener and loops.
///
/// Cloned into every task the node spawns. When the last clone is
/// dropped the channel closes, so loops cannot outlive a node handle
/// that was dropped without a formal shutdown.
#[derive(Clone)]
pub struct StopSignal {
    sender: broadcast::Sender<()>,
}

impl StopSignal {
    /// Create the signal for one node
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Tell every loop and listener of this node to wind down
    pub fn stop(&self) {
        let _ = self.sender.send(());
    }

    /// A listener for one loop or server task
    pub fn listener(&self) -> StopListener {
        StopListener {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A single task's view of the node stop signal
pub struct StopListener {
    receiver: broadcast::Receiver<()>,
}

impl StopListener {
    /// Resolves once the node is stopping, or once every handle to the
    /// signal is gone
    pub async fn stopped(&mut self) {
        let _ = self.receiver.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{HttpMethod, RestServer, Route, RouteResponse};

    #[tokio::test]
    async fn test_stop_winds_down_a_node_listener() {
        let mut server = RestServer::new();
        server.add_route(Route::new(HttpMethod::Get, "/cluster/status", |_, _, _| {
            RouteResponse::new(200)
        }));

        let stop = StopSignal::new();
        let (_addr, task) = server.serve("127.0.0.1:0", &stop).await.unwrap();

        stop.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_signal_releases_waiting_loops() {
        let stop = StopSignal::new();
        let mut listener = stop.listener();
        drop(stop);

        // Resolves because the channel closed, not because stop() ran
        listener.stopped().await;
    }
}
