//! Per-client rate limiting for `/connections` and `/policies`.
//!
//! One `governor` token bucket per source IP, held in a `DashMap` so
//! concurrent requests from different clients never contend on the same
//! lock — the same pairing used for keyed limiting in the reference
//! `fc-router` connection pool. If the limiter can't be constructed (a
//! zero-valued quota), the middleware degrades to allow-all rather than
//! reject every request, per the propagation policy's "fail open" carve-out
//! for non-critical infrastructure.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::error::FirewallError;

type ClientLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct RateLimitState {
    quota: Option<Quota>,
    limiters: DashMap<IpAddr, Arc<ClientLimiter>>,
}

impl RateLimitState {
    /// `times` requests per `window`. A `times` of zero disables the quota
    /// and the limiter allows everything.
    pub fn new(times: u32, window: Duration) -> Self {
        let quota = NonZeroU32::new(times).and_then(|burst| {
            let interval = window.checked_div(times).unwrap_or(Duration::from_millis(1));
            Quota::with_period(interval).map(|q| q.allow_burst(burst))
        });
        Self {
            quota,
            limiters: DashMap::new(),
        }
    }

    fn check(&self, ip: IpAddr) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        let limiter = self
            .limiters
            .entry(ip)
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota)))
            .clone();
        limiter.check().is_ok()
    }
}

pub async fn enforce(
    State(state): State<Arc<RateLimitState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, FirewallError> {
    if state.check(addr.ip()) {
        Ok(next.run(request).await)
    } else {
        Err(FirewallError::RateLimited)
    }
}
