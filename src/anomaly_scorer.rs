//! The external anomaly-detection collaborator.
//!
//! The real service lives outside this crate's scope; what's defined here
//! is the interface contract plus a test/demo stub that implements it.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::FirewallError;
use crate::models::Connection;

/// A synchronous (from the caller's point of view, batch-in/batch-out)
/// operation: score a batch of connections, one float per connection, in
/// the same order, or fail the whole batch.
#[async_trait]
pub trait AnomalyScorer: Send + Sync {
    async fn analyze(&self, connections: &[Connection]) -> Result<Vec<f64>, FirewallError>;
}

/// A stand-in for the real anomaly-detection service: sleeps to simulate
/// inference latency, occasionally fails, and otherwise returns uniformly
/// random scores rounded to 3 decimal places.
pub struct MockAnomalyScorer {
    processing_time: Duration,
    error_rate: f64,
}

impl MockAnomalyScorer {
    pub fn new(processing_time_ms: u64, error_rate: f64) -> Self {
        Self {
            processing_time: Duration::from_millis(processing_time_ms),
            error_rate,
        }
    }
}

#[async_trait]
impl AnomalyScorer for MockAnomalyScorer {
    async fn analyze(&self, connections: &[Connection]) -> Result<Vec<f64>, FirewallError> {
        if connections.is_empty() {
            return Ok(Vec::new());
        }

        tokio::time::sleep(self.processing_time).await;

        if rand::thread_rng().gen::<f64>() < self.error_rate {
            return Err(FirewallError::ScorerFailed(
                "simulated AI service unavailability".to_string(),
            ));
        }

        let scores = connections
            .iter()
            .map(|_| round_to_3dp(rand::thread_rng().gen_range(0.0..=1.0)))
            .collect();
        Ok(scores)
    }
}

fn round_to_3dp(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn dummy_connection() -> Connection {
        Connection {
            connection_id: "c1".to_string(),
            source_ip: "1.1.1.1".to_string(),
            destination_ip: "8.8.8.8".to_string(),
            destination_port: 80,
            protocol: "TCP".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_batch_returns_empty_list_without_dispatch() {
        let scorer = MockAnomalyScorer::new(0, 0.0);
        let scores = scorer.analyze(&[]).await.unwrap();
        assert!(scores.is_empty());
    }

    #[tokio::test]
    async fn scores_are_in_range_and_rounded() {
        let scorer = MockAnomalyScorer::new(0, 0.0);
        let conns = vec![dummy_connection(), dummy_connection()];
        let scores = scorer.analyze(&conns).await.unwrap();
        assert_eq!(scores.len(), 2);
        for s in scores {
            assert!((0.0..=1.0).contains(&s));
            let rounded = (s * 1000.0).round() / 1000.0;
            assert_eq!(s, rounded);
        }
    }

    #[tokio::test]
    async fn always_fails_when_error_rate_is_one() {
        let scorer = MockAnomalyScorer::new(0, 1.0);
        let result = scorer.analyze(&[dummy_connection()]).await;
        assert!(result.is_err());
    }
}
