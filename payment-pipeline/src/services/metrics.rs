use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

use crate::models::PaymentStatus;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
pub static PAYMENT_AMOUNT_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static PAYMENTS_SETTLED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Install the global recorder and the custom registry. Call once from `main`.
pub fn init_metrics() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    if METRICS_HANDLE.set(handle).is_err() {
        anyhow::bail!("metrics already initialized");
    }

    let registry = Registry::new();

    // Amounts in minor units, counted when a payment is created.
    let amount_counter = IntCounterVec::new(
        Opts::new(
            "payment_amount_total",
            "Total amount of initiated payments by currency (in minor units)",
        ),
        &["currency"],
    )
    .context("failed to create payment_amount_total")?;

    let settled_counter = IntCounterVec::new(
        Opts::new(
            "payments_settled_total",
            "Payments reaching a terminal status, by status",
        ),
        &["status"],
    )
    .context("failed to create payments_settled_total")?;

    registry
        .register(Box::new(amount_counter.clone()))
        .context("failed to register payment_amount_total")?;
    registry
        .register(Box::new(settled_counter.clone()))
        .context("failed to register payments_settled_total")?;

    // Only reachable once, guarded by METRICS_HANDLE above.
    let _ = PROMETHEUS_REGISTRY.set(registry);
    let _ = PAYMENT_AMOUNT_TOTAL.set(amount_counter);
    let _ = PAYMENTS_SETTLED_TOTAL.set(settled_counter);

    Ok(())
}

pub fn record_amount(currency: &str, amount: i64) {
    if let (Some(counter), Ok(amount)) = (PAYMENT_AMOUNT_TOTAL.get(), u64::try_from(amount)) {
        counter.with_label_values(&[currency]).inc_by(amount);
    }
}

pub fn record_settlement(status: PaymentStatus) {
    if let Some(counter) = PAYMENTS_SETTLED_TOTAL.get() {
        counter.with_label_values(&[status.as_str()]).inc();
    }
}

pub fn record_webhook(outcome: &'static str) {
    metrics::counter!("payment_webhooks_total", "status" => outcome).increment(1);
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry.gather(), &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_before_init_is_a_noop() {
        record_amount("IDR", 100);
        record_settlement(PaymentStatus::Success);
        assert!(get_metrics().starts_with("# Metrics recorder not initialized"));
    }
}
