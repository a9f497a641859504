//! # Prometheus Metrics
//!
//! Operational metrics for the issuer, scraped at `/metrics` on the metrics
//! port. Everything is registered in a dedicated [`prometheus::Registry`]
//! under the `otm` namespace.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use otm_protocol::issuer::RegistryStats;

/// Metric handles for the node. Cloning shares the underlying counters.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Tokens minted.
    pub tokens_issued_total: IntCounter,
    /// Face value minted, minor units.
    pub value_issued_total: IntCounter,
    /// Face value credited back to presenters, minor units.
    pub value_redeemed_total: IntCounter,
    /// Redemption batches refused, labelled by reason.
    pub redemptions_rejected_total: IntCounterVec,
    /// Double spends caught by redemption or transfer sync.
    pub double_spends_total: IntCounter,
    /// Expired roots refunded to their purchaser.
    pub refunds_total: IntCounter,
    pub value_refunded_total: IntCounter,
    /// Online divisions performed by the issuer.
    pub divisions_total: IntCounter,
    pub transfers_synced_total: IntCounter,
    /// Minted value neither redeemed nor refunded.
    pub outstanding_value: IntGauge,
    pub request_latency_seconds: Histogram,
}

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    metric: C,
) -> Result<C, prometheus::Error> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Create and register every metric. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("otm".into()), None)?;

        let tokens_issued_total = register(
            &registry,
            IntCounter::new("tokens_issued_total", "Tokens minted")?,
        )?;
        let value_issued_total = register(
            &registry,
            IntCounter::new("value_issued_total", "Face value minted, in minor units")?,
        )?;
        let value_redeemed_total = register(
            &registry,
            IntCounter::new(
                "value_redeemed_total",
                "Value credited back to presenters, in minor units",
            )?,
        )?;
        let redemptions_rejected_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("redemptions_rejected_total", "Redemption batches refused"),
                &["reason"],
            )?,
        )?;
        let double_spends_total = register(
            &registry,
            IntCounter::new("double_spends_total", "Double spends detected")?,
        )?;
        let refunds_total = register(
            &registry,
            IntCounter::new("refunds_total", "Expired roots refunded to their purchaser")?,
        )?;
        let value_refunded_total = register(
            &registry,
            IntCounter::new("value_refunded_total", "Value refunded, in minor units")?,
        )?;
        let divisions_total = register(
            &registry,
            IntCounter::new("divisions_total", "Online token divisions")?,
        )?;
        let transfers_synced_total = register(
            &registry,
            IntCounter::new("transfers_synced_total", "Offline transfer records accepted")?,
        )?;
        let outstanding_value = register(
            &registry,
            IntGauge::new(
                "outstanding_value",
                "Minted value neither redeemed nor refunded, in minor units",
            )?,
        )?;
        let request_latency_seconds = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new("request_latency_seconds", "API request latency in seconds")
                    .buckets(vec![
                        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                    ]),
            )?,
        )?;

        Ok(Self {
            registry,
            tokens_issued_total,
            value_issued_total,
            value_redeemed_total,
            redemptions_rejected_total,
            double_spends_total,
            refunds_total,
            value_refunded_total,
            divisions_total,
            transfers_synced_total,
            outstanding_value,
            request_latency_seconds,
        })
    }

    /// Refresh gauges from a registry snapshot.
    pub fn observe_stats(&self, stats: &RegistryStats) {
        self.outstanding_value
            .set(i64::try_from(stats.outstanding_value).unwrap_or(i64::MAX));
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_namespace() {
        let m = NodeMetrics::new().unwrap();
        m.tokens_issued_total.inc_by(3);
        m.redemptions_rejected_total
            .with_label_values(&["double_spend"])
            .inc();
        let text = m.encode().unwrap();
        assert!(text.contains("otm_tokens_issued_total 3"));
        assert!(text.contains("otm_redemptions_rejected_total{reason=\"double_spend\"} 1"));
    }

    #[test]
    fn outstanding_gauge_tracks_stats() {
        let m = NodeMetrics::new().unwrap();
        m.observe_stats(&RegistryStats {
            outstanding_value: 130,
            ..RegistryStats::default()
        });
        assert_eq!(m.outstanding_value.get(), 130);
    }
}
