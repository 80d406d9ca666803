//! Prometheus metrics.
//!
//! Metrics are domain-specific rather than generic event counters; use
//! traces for event-level granularity during investigations.

use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Chain ===
    pub chain_height: Gauge,
    pub finalized_height: Gauge,
    pub blocks_applied: Counter,
    pub blocks_reverted: Counter,

    // === Pool ===
    pub pool_size: Gauge,
    pub transactions_removed: Counter,

    // === Sync / peers ===
    pub sync_active: Gauge,
    pub peers_penalized: Counter,

    // === Storage ===
    pub storage_read_latency: Histogram,
    pub storage_write_latency: Histogram,

    // === Network ===
    pub messages_broadcast: Counter,
}

fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| Metrics {
        chain_height: register_gauge!("forgeline_chain_height", "Height of the chain tip")
            .expect("metric registration is infallible at startup"),
        finalized_height: register_gauge!(
            "forgeline_finalized_height",
            "Finalized block height"
        )
        .expect("metric registration is infallible at startup"),
        blocks_applied: register_counter!(
            "forgeline_blocks_applied_total",
            "Blocks applied to the chain"
        )
        .expect("metric registration is infallible at startup"),
        blocks_reverted: register_counter!(
            "forgeline_blocks_reverted_total",
            "Blocks reverted from the tip"
        )
        .expect("metric registration is infallible at startup"),
        pool_size: register_gauge!(
            "forgeline_pool_size",
            "Unconfirmed transactions in the pool"
        )
        .expect("metric registration is infallible at startup"),
        transactions_removed: register_counter!(
            "forgeline_transactions_removed_total",
            "Transactions removed from the pool"
        )
        .expect("metric registration is infallible at startup"),
        sync_active: register_gauge!(
            "forgeline_sync_active",
            "Whether a sync mechanism is running"
        )
        .expect("metric registration is infallible at startup"),
        peers_penalized: register_counter!(
            "forgeline_peers_penalized_total",
            "Peer penalties applied"
        )
        .expect("metric registration is infallible at startup"),
        storage_read_latency: register_histogram!(
            "forgeline_storage_read_seconds",
            "Storage read latency"
        )
        .expect("metric registration is infallible at startup"),
        storage_write_latency: register_histogram!(
            "forgeline_storage_write_seconds",
            "Storage write latency"
        )
        .expect("metric registration is infallible at startup"),
        messages_broadcast: register_counter!(
            "forgeline_messages_broadcast_total",
            "Messages broadcast to peers"
        )
        .expect("metric registration is infallible at startup"),
    })
}

pub fn record_chain_height(height: u64) {
    metrics().chain_height.set(height as f64);
}

pub fn record_finalized_height(height: u64) {
    metrics().finalized_height.set(height as f64);
}

pub fn record_block_applied() {
    metrics().blocks_applied.inc();
}

pub fn record_block_reverted() {
    metrics().blocks_reverted.inc();
}

pub fn record_pool_size(size: usize) {
    metrics().pool_size.set(size as f64);
}

pub fn record_transaction_removed() {
    metrics().transactions_removed.inc();
}

pub fn record_sync_active(active: bool) {
    metrics().sync_active.set(if active { 1.0 } else { 0.0 });
}

pub fn record_peer_penalized() {
    metrics().peers_penalized.inc();
}

pub fn record_storage_read(seconds: f64) {
    metrics().storage_read_latency.observe(seconds);
}

pub fn record_storage_write(seconds: f64) {
    metrics().storage_write_latency.observe(seconds);
}

pub fn record_message_broadcast() {
    metrics().messages_broadcast.inc();
}
