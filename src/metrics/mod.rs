//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce assignment per strategy
//! - Transaction sends, resends and confirmations
//! - Duplicate rejections and cancellations
//! - Reconciliation failures

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

lazy_static! {
    pub static ref NONCES_ASSIGNED: IntCounterVec = register_int_counter_vec!(
        "sequencer_nonces_assigned_total",
        "Total nonces handed out",
        &["strategy"]
    ).unwrap();

    pub static ref TX_SENT: IntCounterVec = register_int_counter_vec!(
        "sequencer_transactions_sent_total",
        "Total transactions propagated for the first time",
        &["strategy"]
    ).unwrap();

    pub static ref TX_RESENT: IntCounterVec = register_int_counter_vec!(
        "sequencer_transactions_resent_total",
        "Total transactions resent by reconciliation",
        &["strategy"]
    ).unwrap();

    pub static ref TX_CONFIRMED: IntCounterVec = register_int_counter_vec!(
        "sequencer_transactions_confirmed_total",
        "Total pending transactions evicted because the chain nonce passed them",
        &["strategy"]
    ).unwrap();

    pub static ref TX_REJECTED: IntCounterVec = register_int_counter_vec!(
        "sequencer_transactions_rejected_total",
        "Total duplicate sends rejected",
        &["reason"]
    ).unwrap();

    pub static ref TX_CANCELLED: IntCounterVec = register_int_counter_vec!(
        "sequencer_transactions_cancelled_total",
        "Total scheduled transactions cancelled before dispatch",
        &[]
    ).unwrap();

    pub static ref RECONCILE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "sequencer_reconcile_failures_total",
        "Total failed reconciliation passes",
        &[]
    ).unwrap();

    pub static ref TRACKED_ACCOUNTS: IntGaugeVec = register_int_gauge_vec!(
        "sequencer_tracked_accounts",
        "Accounts known to the registry",
        &[]
    ).unwrap();
}

/// Render every registered metric in the text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_nonce_assigned(strategy: &str, count: u64) {
    NONCES_ASSIGNED.with_label_values(&[strategy]).inc_by(count);
}

pub fn record_tx_sent(strategy: &str) {
    TX_SENT.with_label_values(&[strategy]).inc();
}

pub fn record_tx_resent(strategy: &str, count: usize) {
    TX_RESENT.with_label_values(&[strategy]).inc_by(count as u64);
}

pub fn record_tx_confirmed(strategy: &str, count: usize) {
    TX_CONFIRMED.with_label_values(&[strategy]).inc_by(count as u64);
}

pub fn record_tx_rejected(reason: &str) {
    TX_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_tx_cancelled() {
    TX_CANCELLED.with_label_values(&[]).inc();
}

pub fn record_reconcile_failure() {
    RECONCILE_FAILURES.with_label_values(&[]).inc();
}

pub fn record_tracked_accounts(count: usize) {
    TRACKED_ACCOUNTS.with_label_values(&[]).set(count as i64);
}
