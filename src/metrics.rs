//! Cluster metrics
//!
//! Each node publishes a small fixed set of counters and gauges,
//! served in Prometheus text format by the binaries' metrics listener.
//! The set is known at compile time, so there is no registry: gather
//! walks the static list in `standard`.

use std::sync::atomic::{AtomicI64, Ordering};

/// How a metric's value moves
#[derive(Debug, Clone, Copy)]
pub enum MetricKind {
    /// Event count, only ever grows
    Counter,
    /// Level sampled by a loop pass, overwritten each time
    Gauge,
}

/// One exported node metric
pub struct NodeMetric {
    name: &'static str,
    kind: MetricKind,
    value: AtomicI64,
}

impl NodeMetric {
    /// Declare a counter
    pub const fn counter(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            value: AtomicI64::new(0),
        }
    }

    /// Declare a gauge
    pub const fn gauge(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            value: AtomicI64::new(0),
        }
    }

    /// Count one event
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the level observed by the current loop pass
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Append this metric's exposition lines
    fn render_into(&self, output: &mut String) {
        let kind = match self.kind {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        };
        output.push_str(&format!(
            "# TYPE {} {}\n{} {}\n",
            self.name,
            kind,
            self.name,
            self.get()
        ));
    }
}

/// The metrics every gridmesh node exports
pub mod standard {
    use super::NodeMetric;

    pub static KNOWN_MASTERS: NodeMetric = NodeMetric::gauge("gridmesh_known_masters");
    pub static CONTACTABLE_MASTERS: NodeMetric = NodeMetric::gauge("gridmesh_contactable_masters");
    pub static ATTACHED_WORKERS: NodeMetric = NodeMetric::gauge("gridmesh_attached_workers");
    pub static PENDING_PROPOSALS: NodeMetric = NodeMetric::gauge("gridmesh_pending_proposals");
    pub static STATUS_POLLS: NodeMetric = NodeMetric::counter("gridmesh_status_polls_total");
    pub static CLAIMS_COMMITTED: NodeMetric =
        NodeMetric::counter("gridmesh_claims_committed_total");

    /// Every exported metric, in gather order
    pub static ALL: [&NodeMetric; 6] = [
        &KNOWN_MASTERS,
        &CONTACTABLE_MASTERS,
        &ATTACHED_WORKERS,
        &PENDING_PROPOSALS,
        &STATUS_POLLS,
        &CLAIMS_COMMITTED,
    ];
}

/// Render every node metric in Prometheus text format
pub fn gather_node_metrics() -> String {
    let mut output = String::new();
    for metric in standard::ALL.iter() {
        metric.render_into(&mut output);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_renders_with_its_kind() {
        let polls = NodeMetric::counter("test_polls_total");
        polls.inc();
        polls.inc();
        assert_eq!(polls.get(), 2);

        let mut output = String::new();
        polls.render_into(&mut output);
        assert_eq!(output, "# TYPE test_polls_total counter\ntest_polls_total 2\n");
    }

    #[test]
    fn test_gauge_tracks_the_latest_level() {
        let peers = NodeMetric::gauge("test_peers");
        peers.set(3);
        peers.set(1);
        assert_eq!(peers.get(), 1);

        let mut output = String::new();
        peers.render_into(&mut output);
        assert_eq!(output, "# TYPE test_peers gauge\ntest_peers 1\n");
    }

    #[test]
    fn test_gather_covers_every_standard_metric() {
        let exported = gather_node_metrics();
        for metric in standard::ALL.iter() {
            assert!(
                exported.contains(&format!("\n{} ", metric.name)),
                "{} missing from gather output",
                metric.name
            );
        }
    }
}
