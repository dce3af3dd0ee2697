//! Environment-driven configuration and in-process metrics. Every field has
//! a hardcoded default, `from_env()` overrides it from a named variable,
//! and counters are plain atomics exposed as Prometheus text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::ai_client::BatchConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub ai_max_batch_size: usize,
    pub ai_batch_timeout_ms: u64,
    pub ai_rate_limit_rps: f64,
    pub anomaly_alert_threshold: f64,
    pub api_rate_limit_times: u32,
    pub api_rate_limit_seconds: u64,
    pub ai_mock_error_rate: f64,
    pub ai_mock_processing_time_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            ai_max_batch_size: 10,
            ai_batch_timeout_ms: 50,
            ai_rate_limit_rps: 10.0,
            anomaly_alert_threshold: 0.8,
            api_rate_limit_times: 1000,
            api_rate_limit_seconds: 60,
            ai_mock_error_rate: 0.05,
            ai_mock_processing_time_ms: 10,
        }
    }
}

impl AppConfig {
    /// Builds the effective config from the process environment, falling
    /// back to [`Default`] for anything unset or unparseable.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            bind_addr: env_string("BIND_ADDR", default.bind_addr),
            ai_max_batch_size: env_usize("AI_MAX_BATCH_SIZE", default.ai_max_batch_size),
            ai_batch_timeout_ms: env_u64("AI_BATCH_TIMEOUT_MS", default.ai_batch_timeout_ms),
            ai_rate_limit_rps: env_f64("AI_RATE_LIMIT_RPS", default.ai_rate_limit_rps),
            anomaly_alert_threshold: env_f64(
                "ANOMALY_ALERT_THRESHOLD",
                default.anomaly_alert_threshold,
            ),
            api_rate_limit_times: env_u32("API_RATE_LIMIT_TIMES", default.api_rate_limit_times),
            api_rate_limit_seconds: env_u64(
                "API_RATE_LIMIT_SECONDS",
                default.api_rate_limit_seconds,
            ),
            ai_mock_error_rate: env_f64("AI_MOCK_ERROR_RATE", default.ai_mock_error_rate),
            ai_mock_processing_time_ms: env_u64(
                "AI_MOCK_PROCESSING_TIME_MS",
                default.ai_mock_processing_time_ms,
            ),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::new(
            self.ai_max_batch_size,
            Duration::from_millis(self.ai_batch_timeout_ms),
            self.ai_rate_limit_rps,
        )
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Process-wide request counters, exposed at `GET /metrics`.
#[derive(Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    decisions_allow: AtomicU64,
    decisions_block: AtomicU64,
    decisions_alert: AtomicU64,
    decisions_drop: AtomicU64,
    scorer_errors_total: AtomicU64,
    policies_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&self, decision: crate::models::Decision) {
        use crate::models::Decision;
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        let counter = match decision {
            Decision::Allow => &self.decisions_allow,
            Decision::Block => &self.decisions_block,
            Decision::Alert => &self.decisions_alert,
            Decision::Drop => &self.decisions_drop,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scorer_error(&self) {
        self.scorer_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_policy_added(&self) {
        self.policies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP firewall_connections_total Connections evaluated.\n\
             # TYPE firewall_connections_total counter\n\
             firewall_connections_total {}\n\
             # HELP firewall_decisions_total Decisions by verdict.\n\
             # TYPE firewall_decisions_total counter\n\
             firewall_decisions_total{{decision=\"allow\"}} {}\n\
             firewall_decisions_total{{decision=\"block\"}} {}\n\
             firewall_decisions_total{{decision=\"alert\"}} {}\n\
             firewall_decisions_total{{decision=\"drop\"}} {}\n\
             # HELP firewall_scorer_errors_total Anomaly scorer failures.\n\
             # TYPE firewall_scorer_errors_total counter\n\
             firewall_scorer_errors_total {}\n\
             # HELP firewall_policies_total Policies currently registered.\n\
             # TYPE firewall_policies_total gauge\n\
             firewall_policies_total {}\n",
            self.connections_total.load(Ordering::Relaxed),
            self.decisions_allow.load(Ordering::Relaxed),
            self.decisions_block.load(Ordering::Relaxed),
            self.decisions_alert.load(Ordering::Relaxed),
            self.decisions_drop.load(Ordering::Relaxed),
            self.scorer_errors_total.load(Ordering::Relaxed),
            self.policies_total.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Decision;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.ai_max_batch_size, 10);
        assert_eq!(config.ai_batch_timeout_ms, 50);
        assert_eq!(config.anomaly_alert_threshold, 0.8);
        assert_eq!(config.api_rate_limit_times, 1000);
    }

    #[test]
    fn metrics_record_decisions_by_kind() {
        let metrics = Metrics::new();
        metrics.record_decision(Decision::Allow);
        metrics.record_decision(Decision::Alert);
        metrics.record_decision(Decision::Alert);

        let text = metrics.to_prometheus();
        assert!(text.contains("decision=\"allow\"} 1"));
        assert!(text.contains("decision=\"alert\"} 2"));
    }
}
