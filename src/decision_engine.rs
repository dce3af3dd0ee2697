//! Fingerprint-cached scoring and verdict resolution.
//!
//! Wraps the AI client and the policy manager behind a single
//! `evaluate_connection` call: a repeat 4-tuple (source IP, destination IP,
//! port, protocol) reuses a cached anomaly score instead of re-dispatching
//! to the scorer, and the final decision always applies the strict
//! `score > threshold` override — no policy action downgrades an alert back
//! to allow.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::ai_client::AIBatchingClient;
use crate::error::FirewallError;
use crate::models::{AnalyzedConnection, Connection, Decision, PolicyAction};
use crate::policy_manager::PolicyManager;

fn fingerprint(connection: &Connection) -> String {
    let mut hasher = Sha256::new();
    hasher.update(connection.fingerprint_input().as_bytes());
    hex::encode(hasher.finalize())
}

fn resolve_verdict(policy_action: Option<PolicyAction>, score: f64, threshold: f64) -> Decision {
    match policy_action {
        Some(PolicyAction::Block) => Decision::Block,
        Some(PolicyAction::Alert) => Decision::Alert,
        Some(PolicyAction::Allow) => {
            if score > threshold {
                Decision::Alert
            } else {
                Decision::Allow
            }
        }
        None => {
            if score > threshold {
                Decision::Alert
            } else {
                Decision::Drop
            }
        }
    }
}

/// Ties the AI client and policy manager together, caching anomaly scores
/// by connection-tuple fingerprint and retaining every evaluated connection
/// for later lookup.
pub struct DecisionEngine {
    ai_client: Arc<AIBatchingClient>,
    policy_manager: Arc<PolicyManager>,
    threshold: f64,
    score_cache: RwLock<HashMap<String, f64>>,
    results: RwLock<HashMap<String, AnalyzedConnection>>,
}

impl DecisionEngine {
    pub fn new(
        ai_client: Arc<AIBatchingClient>,
        policy_manager: Arc<PolicyManager>,
        threshold: f64,
    ) -> Self {
        Self {
            ai_client,
            policy_manager,
            threshold,
            score_cache: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
        }
    }

    /// Scores `connection` (reusing a cached score for a repeat fingerprint),
    /// matches it against the policy table, resolves the verdict, and stores
    /// the result for later lookup by `connection_id`.
    ///
    /// On scorer failure, nothing is cached or stored and the error
    /// propagates to the caller.
    pub async fn evaluate_connection(
        &self,
        connection: Connection,
    ) -> Result<AnalyzedConnection, FirewallError> {
        let fp = fingerprint(&connection);

        let cached_score = { self.score_cache.read().await.get(&fp).copied() };
        let score = match cached_score {
            Some(score) => score,
            None => {
                let score = self.ai_client.get_anomaly_score(connection.clone()).await?;
                self.score_cache.write().await.insert(fp, score);
                score
            }
        };

        let matched_policy = self.policy_manager.get_matching_policy(&connection).await;
        let decision = resolve_verdict(
            matched_policy.as_ref().map(|p| p.action),
            score,
            self.threshold,
        );

        let analyzed = AnalyzedConnection {
            connection_id: connection.connection_id.clone(),
            source_ip: connection.source_ip,
            destination_ip: connection.destination_ip,
            destination_port: connection.destination_port,
            protocol: connection.protocol,
            timestamp: connection.timestamp,
            anomaly_score: score,
            decision,
            policy_id: matched_policy.map(|p| p.policy_id),
        };

        self.results
            .write()
            .await
            .insert(analyzed.connection_id.clone(), analyzed.clone());

        Ok(analyzed)
    }

    pub async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<AnalyzedConnection, FirewallError> {
        self.results
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| FirewallError::ConnectionNotFound(connection_id.to_string()))
    }
}
