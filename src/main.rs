use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ai_firewall::ai_client::AIBatchingClient;
use ai_firewall::anomaly_scorer::MockAnomalyScorer;
use ai_firewall::config::{AppConfig, Metrics};
use ai_firewall::decision_engine::DecisionEngine;
use ai_firewall::policy_manager::PolicyManager;
use ai_firewall::rate_limit::RateLimitState;
use ai_firewall::server::{router, AppState};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "ai-firewall")]
struct Args {
    /// Overrides BIND_ADDR from the environment.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = AppConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let scorer = Arc::new(MockAnomalyScorer::new(
        config.ai_mock_processing_time_ms,
        config.ai_mock_error_rate,
    ));
    let ai_client = Arc::new(AIBatchingClient::new(scorer, config.batch_config()));
    ai_client.start().await;

    let policy_manager = Arc::new(PolicyManager::new());
    let decision_engine = Arc::new(DecisionEngine::new(
        ai_client.clone(),
        policy_manager.clone(),
        config.anomaly_alert_threshold,
    ));
    let metrics = Arc::new(Metrics::new());

    let state = Arc::new(AppState {
        decision_engine,
        policy_manager,
        metrics,
    });
    let rate_limit = Arc::new(RateLimitState::new(
        config.api_rate_limit_times,
        Duration::from_secs(config.api_rate_limit_seconds),
    ));

    let app = router(state, rate_limit);
    let addr: SocketAddr = config.bind_addr.parse()?;
    log::info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(ai_client))
    .await?;

    Ok(())
}

async fn shutdown_signal(ai_client: Arc<AIBatchingClient>) {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutdown signal received, draining the AI batching client");
    ai_client.stop().await;
}
