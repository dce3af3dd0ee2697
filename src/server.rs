//! The HTTP surface: `POST /connections`, `POST /policies`,
//! `GET /connections/{id}`, plus the ambient `/health`, `/ready`, and
//! `/metrics` endpoints. Handlers stay thin — all the real work happens in
//! [`crate::decision_engine`] and [`crate::policy_manager`].

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;

use crate::config::Metrics;
use crate::decision_engine::DecisionEngine;
use crate::error::FirewallError;
use crate::models::{Connection, ConnectionInput, Policy};
use crate::policy_manager::PolicyManager;
use crate::rate_limit::RateLimitState;

pub struct AppState {
    pub decision_engine: Arc<DecisionEngine>,
    pub policy_manager: Arc<PolicyManager>,
    pub metrics: Arc<Metrics>,
}

/// A `Json<T>` extractor that reports malformed or schema-invalid bodies as
/// `FirewallError::Validation` (422) instead of axum's default 400.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = FirewallError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => Err(validation_error(rejection)),
        }
    }
}

fn validation_error(rejection: JsonRejection) -> FirewallError {
    FirewallError::Validation(rejection.to_string())
}

pub fn router(state: Arc<AppState>, rate_limit: Arc<RateLimitState>) -> Router {
    let limited = Router::new()
        .route("/connections", post(create_connection))
        .route("/policies", post(create_policy))
        .layer(axum::middleware::from_fn_with_state(
            rate_limit,
            crate::rate_limit::enforce,
        ));

    Router::new()
        .route("/connections/:connection_id", get(get_connection))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .merge(limited)
        .layer(tower_http::limit::RequestBodyLimitLayer::new(64 * 1024))
        .with_state(state)
}

async fn create_connection(
    State(state): State<Arc<AppState>>,
    ValidatedJson(input): ValidatedJson<ConnectionInput>,
) -> Result<impl IntoResponse, FirewallError> {
    let connection = Connection::from_input(input)?;
    log::info!("evaluating connection {}", connection.connection_id);

    let analyzed = state.decision_engine.evaluate_connection(connection).await;
    match analyzed {
        Ok(result) => {
            state.metrics.record_decision(result.decision);
            Ok((StatusCode::OK, Json(result)))
        }
        Err(err) => {
            state.metrics.record_scorer_error();
            Err(err)
        }
    }
}

async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> Result<impl IntoResponse, FirewallError> {
    let connection = state.decision_engine.get_connection(&connection_id).await?;
    Ok(Json(connection))
}

async fn create_policy(
    State(state): State<Arc<AppState>>,
    ValidatedJson(policy): ValidatedJson<Policy>,
) -> Result<impl IntoResponse, FirewallError> {
    let policy = state.policy_manager.add_policy(policy).await?;
    state.metrics.record_policy_added();
    log::info!("added policy {}", policy.policy_id);
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn health() -> &'static str {
    "ok"
}

async fn ready() -> &'static str {
    "ready"
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.to_prometheus()
}
