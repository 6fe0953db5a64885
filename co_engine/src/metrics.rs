//! ABOUTME: Prometheus metrics for the delivery engine
//! ABOUTME: Per-channel counters, queue depth gauges, and latency histograms

use co_core::ChannelKind;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge, histogram::Histogram};
use prometheus_client::registry::Registry;
use std::collections::HashMap;

/// Metrics for one channel
#[derive(Debug, Clone)]
pub struct ChannelMetrics {
    /// Items accepted by the provider
    pub sent: Counter,
    /// Items confirmed delivered (callbacks or in-app)
    pub delivered: Counter,
    /// Failed attempts (transient and permanent)
    pub failed: Counter,
    /// Bounce callbacks
    pub bounced: Counter,
    /// Batches deferred by rate limiting
    pub deferred: Counter,
    /// Jobs moved to the dead letter state
    pub dead_lettered: Counter,
    /// Pending jobs in the persistent queue
    pub queue_depth: Gauge,
    /// Dispatch tasks currently running
    pub active_workers: Gauge,
    /// Dispatched batch size / policy capacity
    pub batch_fill_ratio: Histogram,
    /// Claim-to-settle latency per batch
    pub dispatch_seconds: Histogram,
}

impl ChannelMetrics {
    fn new() -> Self {
        Self {
            sent: Counter::default(),
            delivered: Counter::default(),
            failed: Counter::default(),
            bounced: Counter::default(),
            deferred: Counter::default(),
            dead_lettered: Counter::default(),
            queue_depth: Gauge::default(),
            active_workers: Gauge::default(),
            batch_fill_ratio: Histogram::new([0.1, 0.25, 0.5, 0.75, 0.9, 1.0].into_iter()),
            dispatch_seconds: Histogram::new(
                [0.005, 0.025, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0].into_iter(),
            ),
        }
    }
}

/// Engine-wide metrics, one block per channel
#[derive(Debug)]
pub struct EngineMetrics {
    channels: HashMap<ChannelKind, ChannelMetrics>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let channels = ChannelKind::ALL
            .into_iter()
            .map(|channel| (channel, ChannelMetrics::new()))
            .collect();
        Self { channels }
    }

    pub fn channel(&self, channel: ChannelKind) -> &ChannelMetrics {
        // All four channels are populated in new()
        self.channels
            .get(&channel)
            .expect("metrics exist for every channel")
    }

    /// Register every series into a Prometheus registry
    pub fn register_into(&self, registry: &mut Registry) {
        for (channel, metrics) in &self.channels {
            let prefix = format!("courier_{}", channel.as_str());
            registry.register(
                format!("{}_sent", prefix),
                "Items accepted by the provider",
                metrics.sent.clone(),
            );
            registry.register(
                format!("{}_delivered", prefix),
                "Items confirmed delivered",
                metrics.delivered.clone(),
            );
            registry.register(
                format!("{}_failed", prefix),
                "Failed delivery attempts",
                metrics.failed.clone(),
            );
            registry.register(
                format!("{}_bounced", prefix),
                "Bounced deliveries",
                metrics.bounced.clone(),
            );
            registry.register(
                format!("{}_deferred", prefix),
                "Batches deferred by rate limiting",
                metrics.deferred.clone(),
            );
            registry.register(
                format!("{}_dead_lettered", prefix),
                "Jobs moved to the dead letter state",
                metrics.dead_lettered.clone(),
            );
            registry.register(
                format!("{}_queue_depth", prefix),
                "Pending jobs in the persistent queue",
                metrics.queue_depth.clone(),
            );
            registry.register(
                format!("{}_active_workers", prefix),
                "Dispatch tasks currently running",
                metrics.active_workers.clone(),
            );
            registry.register(
                format!("{}_batch_fill_ratio", prefix),
                "Dispatched batch size over policy capacity",
                metrics.batch_fill_ratio.clone(),
            );
            registry.register(
                format!("{}_dispatch_seconds", prefix),
                "Claim-to-settle latency per batch",
                metrics.dispatch_seconds.clone(),
            );
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_channel_has_metrics() {
        let metrics = EngineMetrics::new();
        for channel in ChannelKind::ALL {
            metrics.channel(channel).sent.inc();
        }
        assert_eq!(metrics.channel(ChannelKind::Email).sent.get(), 1);
    }

    #[test]
    fn test_registration_encodes() {
        use prometheus_client::encoding::text::encode;

        let metrics = EngineMetrics::new();
        metrics.channel(ChannelKind::Push).sent.inc();
        metrics.channel(ChannelKind::Push).queue_depth.set(7);

        let mut registry = Registry::default();
        metrics.register_into(&mut registry);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("courier_push_sent"));
        assert!(buffer.contains("courier_push_queue_depth 7"));
    }
}
