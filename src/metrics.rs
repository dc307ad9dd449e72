//! Prometheus metrics
//!
//! All collectors live in one [`Registry`] owned by [`Metrics`], exposed as
//! text on `GET /metrics`.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Outcome label of an intercepted HTLC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtlcOutcome {
    /// Held for a channel request
    Accepted,
    /// Resumed onto the new channel
    Settled,
    /// Failed back to the payer
    Failed,
}

impl HtlcOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Settled => "settled",
            Self::Failed => "failed",
        }
    }
}

/// LSP metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    channel_request_htlcs: IntCounterVec,
    funding_batches: IntCounterVec,
    node_active_channels: IntGauge,
    node_peers: IntGauge,
}

impl Metrics {
    /// Create and register all collectors
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let channel_request_htlcs = IntCounterVec::new(
            Opts::new(
                "lsp_channel_request_htlcs_total",
                "Intercepted HTLCs belonging to channel requests, by outcome",
            ),
            &["result"],
        )?;
        let funding_batches = IntCounterVec::new(
            Opts::new("lsp_funding_batches_total", "Funding batches finished, by outcome"),
            &["result"],
        )?;
        let node_active_channels = IntGauge::with_opts(Opts::new(
            "lsp_node_active_channels",
            "Active channels reported by the node",
        ))?;
        let node_peers = IntGauge::with_opts(Opts::new("lsp_node_peers", "Peers connected to the node"))?;

        registry.register(Box::new(channel_request_htlcs.clone()))?;
        registry.register(Box::new(funding_batches.clone()))?;
        registry.register(Box::new(node_active_channels.clone()))?;
        registry.register(Box::new(node_peers.clone()))?;

        Ok(Self {
            registry,
            channel_request_htlcs,
            funding_batches,
            node_active_channels,
            node_peers,
        })
    }

    /// Count one HTLC outcome
    pub fn record_htlc(&self, outcome: HtlcOutcome) {
        self.channel_request_htlcs.with_label_values(&[outcome.label()]).inc();
    }

    /// Count one finished funding batch
    pub fn record_batch(&self, published: bool) {
        let label = if published { "published" } else { "failed" };
        self.funding_batches.with_label_values(&[label]).inc();
    }

    /// Refresh the node gauges
    pub fn set_node_counts(&self, active_channels: u32, peers: u32) {
        self.node_active_channels.set(active_channels as i64);
        self.node_peers.set(peers as i64);
    }

    /// Current count of one HTLC outcome
    pub fn htlc_count(&self, outcome: HtlcOutcome) -> u64 {
        self.channel_request_htlcs.with_label_values(&[outcome.label()]).get()
    }

    /// Current count of finished batches
    pub fn batch_count(&self, published: bool) -> u64 {
        let label = if published { "published" } else { "failed" };
        self.funding_batches.with_label_values(&[label]).get()
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_encoding() {
        let metrics = Metrics::new().unwrap();
        metrics.record_htlc(HtlcOutcome::Accepted);
        metrics.record_htlc(HtlcOutcome::Accepted);
        metrics.record_htlc(HtlcOutcome::Failed);
        metrics.record_batch(true);
        metrics.set_node_counts(3, 5);

        assert_eq!(metrics.htlc_count(HtlcOutcome::Accepted), 2);
        assert_eq!(metrics.htlc_count(HtlcOutcome::Settled), 0);
        assert_eq!(metrics.batch_count(true), 1);

        let text = metrics.encode().unwrap();
        assert!(text.contains("lsp_channel_request_htlcs_total{result=\"accepted\"} 2"));
        assert!(text.contains("lsp_node_peers 5"));
    }
}
