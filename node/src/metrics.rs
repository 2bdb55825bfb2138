//! # Prometheus Metrics
//!
//! Operational metrics for the node, scraped at `/metrics`. Every value is
//! derived from the node's published [`NodeSnapshot`], so the event loop
//! never touches the registry.
//!
//! Metrics live in a dedicated [`prometheus::Registry`] under the `kestrel`
//! namespace.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use kestrel_protocol::network::{NodeSnapshot, NodeStatus};

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub connected_peers: IntGauge,
    pub known_peers: IntGauge,
    pub chain_height: IntGauge,
    pub pending_transactions: IntGauge,
    /// 0 offline, 1 syncing, 2 active.
    pub node_status: IntGauge,
    pub blocks_applied_total: IntCounter,
    pub blocks_rejected_total: IntCounter,
    pub reorgs_total: IntCounter,
    pub sync_fetch_failures_total: IntCounter,
    pub gossip_accepted_total: IntCounter,
    pub gossip_duplicates_total: IntCounter,
    pub gossip_rejected_total: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Advance a counter to a cumulative total reported by the node.
fn advance(metric: &IntCounter, total: u64) {
    let current = metric.get();
    if total > current {
        metric.inc_by(total - current);
    }
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("kestrel".into()), None)?;
        Ok(Self {
            connected_peers: gauge(&registry, "connected_peers", "Peers with an established session")?,
            known_peers: gauge(&registry, "known_peers", "Peers in the peer store")?,
            chain_height: gauge(&registry, "chain_height", "Index of the chain head")?,
            pending_transactions: gauge(&registry, "pending_transactions", "Transactions waiting in the pool")?,
            node_status: gauge(&registry, "node_status", "0 offline, 1 syncing, 2 active")?,
            blocks_applied_total: counter(&registry, "blocks_applied_total", "Blocks applied to the chain")?,
            blocks_rejected_total: counter(&registry, "blocks_rejected_total", "Blocks that failed validation")?,
            reorgs_total: counter(&registry, "reorgs_total", "Switches to a longer fork")?,
            sync_fetch_failures_total: counter(
                &registry,
                "sync_fetch_failures_total",
                "Block or tip requests that failed or timed out",
            )?,
            gossip_accepted_total: counter(&registry, "gossip_accepted_total", "New gossip envelopes processed")?,
            gossip_duplicates_total: counter(
                &registry,
                "gossip_duplicates_total",
                "Gossip envelopes dropped as already seen",
            )?,
            gossip_rejected_total: counter(&registry, "gossip_rejected_total", "Gossip envelopes that failed checks")?,
            registry,
        })
    }

    pub fn observe(&self, snapshot: &NodeSnapshot) {
        self.connected_peers.set(snapshot.connected_peers as i64);
        self.known_peers.set(snapshot.known_peers as i64);
        self.chain_height.set(snapshot.height as i64);
        self.pending_transactions.set(snapshot.pending_transactions as i64);
        self.node_status.set(match snapshot.status {
            NodeStatus::Offline => 0,
            NodeStatus::Syncing => 1,
            NodeStatus::Active => 2,
        });
        advance(&self.blocks_applied_total, snapshot.sync.applied);
        advance(&self.blocks_rejected_total, snapshot.sync.rejected);
        advance(&self.reorgs_total, snapshot.sync.reorgs);
        advance(&self.sync_fetch_failures_total, snapshot.sync.fetch_failures);
        advance(&self.gossip_accepted_total, snapshot.gossip.accepted);
        advance(&self.gossip_duplicates_total, snapshot.gossip.duplicates);
        advance(&self.gossip_rejected_total, snapshot.gossip.rejected);
    }

    /// All registered metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Renders `/metrics`.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
