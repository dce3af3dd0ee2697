pub mod ai_client;
pub mod anomaly_scorer;
pub mod config;
pub mod decision_engine;
pub mod error;
pub mod models;
pub mod policy_manager;
pub mod rate_limit;
pub mod server;

pub use ai_client::AIBatchingClient;
pub use anomaly_scorer::{AnomalyScorer, MockAnomalyScorer};
pub use config::AppConfig;
pub use decision_engine::DecisionEngine;
pub use error::FirewallError;
pub use policy_manager::PolicyManager;
