use anyhow::Result;
use opentelemetry::metrics::MeterProvider;
use opentelemetry_prometheus::exporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

/// OTEL metrics with Prometheus exporter
pub struct Metrics {
    registry: Registry,
    meter_provider: SdkMeterProvider,
}

impl Metrics {
    /// Create the OTEL → Prometheus pipeline over `registry` and register
    /// every portald instrument.
    pub fn new(registry: Registry) -> Result<Self> {
        let exporter = exporter().with_registry(registry.clone()).build()?;

        let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();

        // Register as global meter provider
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        counters::init(&meter_provider.meter("portald"));

        info!("OTEL metrics configured with Prometheus exporter");

        Ok(Self {
            registry,
            meter_provider,
        })
    }

    /// Pipeline over the process-wide default registry, the one `/metrics`
    /// renders.
    pub fn global() -> Result<Self> {
        Self::new(prometheus::default_registry().clone())
    }

    /// Get a meter for recording metrics
    pub fn meter(&self, name: &'static str) -> opentelemetry::metrics::Meter {
        self.meter_provider.meter(name)
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        render_registry(&self.registry)
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::warn!(error = %e, "failed to shutdown meter provider");
        }
    }
}

/// Text exposition of a registry. Encoding failures render as empty.
pub fn render_registry(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// portald instruments, all with the `portal_` prefix.
///
/// Recording functions are no-ops until [`init`] has run, so library code
/// and tests can call them unconditionally.
pub mod counters {
    use opentelemetry::metrics::{Counter, Gauge};
    use opentelemetry::KeyValue;
    use std::sync::OnceLock;

    // ============================================================================
    // FIREWALL ENGINE
    // ============================================================================

    static GRANTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static REVOKES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static RULE_TOOL_INVOCATIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static RESTORE_SESSIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static EXPIRED_CLEANED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static TIME_UPDATES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static RULE_DRIFT_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // USAGE SYNC
    // ============================================================================

    static USAGE_REPORTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // GRACE MONITOR
    // ============================================================================

    static GRACE_GRANTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static GRACE_REVOCATIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static GRACE_ACTIVE: OnceLock<Gauge<i64>> = OnceLock::new();

    /// Register all instruments with the meter.
    pub fn init(meter: &opentelemetry::metrics::Meter) {
        let _ = GRANTS_TOTAL.set(
            meter
                .u64_counter("portal_grants_total")
                .with_description("Session grants by result")
                .build(),
        );
        let _ = REVOKES_TOTAL.set(
            meter
                .u64_counter("portal_revokes_total")
                .with_description("Session revocations by result")
                .build(),
        );
        let _ = RULE_TOOL_INVOCATIONS_TOTAL.set(
            meter
                .u64_counter("portal_rule_tool_invocations_total")
                .with_description("Rule tool invocations by operation and result")
                .build(),
        );
        let _ = RESTORE_SESSIONS_TOTAL.set(
            meter
                .u64_counter("portal_restore_sessions_total")
                .with_description("Sessions processed by restoration, by outcome")
                .build(),
        );
        let _ = EXPIRED_CLEANED_TOTAL.set(
            meter
                .u64_counter("portal_expired_cleaned_total")
                .with_description("Expired sessions revoked by the sweep")
                .build(),
        );
        let _ = TIME_UPDATES_TOTAL.set(
            meter
                .u64_counter("portal_time_updates_total")
                .with_description("Time accounting batches by result")
                .build(),
        );
        let _ = RULE_DRIFT_TOTAL.set(
            meter
                .u64_counter("portal_rule_drift_total")
                .with_description("Rules found out of line with the ledger, by kind")
                .build(),
        );
        let _ = USAGE_REPORTS_TOTAL.set(
            meter
                .u64_counter("portal_usage_reports_total")
                .with_description("Usage report batches by result")
                .build(),
        );
        let _ = GRACE_GRANTS_TOTAL.set(
            meter
                .u64_counter("portal_grace_grants_total")
                .with_description("Grace access grants by result")
                .build(),
        );
        let _ = GRACE_REVOCATIONS_TOTAL.set(
            meter
                .u64_counter("portal_grace_revocations_total")
                .with_description("Grace access terminations by reason")
                .build(),
        );
        let _ = GRACE_ACTIVE.set(
            meter
                .i64_gauge("portal_grace_active")
                .with_description("IPs currently holding grace access")
                .build(),
        );
    }

    pub fn grant(result: &str) {
        if let Some(c) = GRANTS_TOTAL.get() {
            c.add(1, &[kv("result", result)]);
        }
    }

    pub fn revoke(result: &str) {
        if let Some(c) = REVOKES_TOTAL.get() {
            c.add(1, &[kv("result", result)]);
        }
    }

    pub fn rule_tool_invocation(op: &str, result: &str) {
        if let Some(c) = RULE_TOOL_INVOCATIONS_TOTAL.get() {
            c.add(1, &[kv("op", op), kv("result", result)]);
        }
    }

    pub fn restore_session(outcome: &str) {
        if let Some(c) = RESTORE_SESSIONS_TOTAL.get() {
            c.add(1, &[kv("outcome", outcome)]);
        }
    }

    pub fn expired_cleaned(count: u64) {
        if let Some(c) = EXPIRED_CLEANED_TOTAL.get() {
            c.add(count, &[]);
        }
    }

    pub fn time_update(result: &str) {
        if let Some(c) = TIME_UPDATES_TOTAL.get() {
            c.add(1, &[kv("result", result)]);
        }
    }

    pub fn rule_drift(kind: &str, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(c) = RULE_DRIFT_TOTAL.get() {
            c.add(count, &[kv("kind", kind)]);
        }
    }

    pub fn usage_report(result: &str) {
        if let Some(c) = USAGE_REPORTS_TOTAL.get() {
            c.add(1, &[kv("result", result)]);
        }
    }

    pub fn grace_grant(result: &str) {
        if let Some(c) = GRACE_GRANTS_TOTAL.get() {
            c.add(1, &[kv("result", result)]);
        }
    }

    pub fn grace_revocation(reason: &str) {
        if let Some(c) = GRACE_REVOCATIONS_TOTAL.get() {
            c.add(1, &[kv("reason", reason)]);
        }
    }

    pub fn grace_active_set(count: i64) {
        if let Some(g) = GRACE_ACTIVE.get() {
            g.record(count, &[]);
        }
    }

    fn kv(key: &'static str, value: &str) -> KeyValue {
        KeyValue::new(key, value.to_string())
    }
}
