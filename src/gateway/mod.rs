//! Read API Gateway: a uniform HTTP façade over Storage, with on-demand
//! fetch fallback and per-IP rate limiting.
//!
//! Router assembly follows a merged-sub-router pattern (`CorsLayer::permissive()`,
//! `axum::middleware::from_fn_with_state`), stripped to the single public
//! surface this crate serves — no auth router, no protected/public split,
//! since every endpoint here is a read-only market-data view.

pub mod correlation;
pub mod narrative;
pub mod rate_limit;
pub mod recession;
pub mod routes;

use crate::context::SystemContext;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use rate_limit::GatewayRateLimiter;
use tower_http::cors::CorsLayer;

/// Returns 503 for every request made before the initial preload cycle
/// finishes. `/health` is exempt — it must be reachable to report that
/// preload state in the first place.
async fn readiness_gate(
    State(ctx): State<SystemContext>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if ctx.is_ready() {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub fn build_router(ctx: SystemContext) -> Router {
    let limiter = GatewayRateLimiter::new(ctx.config.gateway_rate_limit_per_min);

    let data_routes = Router::new()
        .route("/api/market/quote/:series_key", get(routes::market_quote))
        .route("/api/market/symbol/:series_key", get(routes::market_symbol))
        .route("/api/economic/series/:series_key", get(routes::economic_series))
        .route("/api/analytics/correlations", get(routes::correlations))
        .route("/api/market/narrative", get(routes::market_narrative))
        .route("/api/recession-probability", get(routes::recession_probability))
        .route("/api/system/incidents", get(routes::system_incidents))
        .layer(axum::middleware::from_fn_with_state(ctx.clone(), readiness_gate));

    Router::new()
        .route("/health", get(routes::health))
        .merge(data_routes)
        .with_state(ctx)
        .layer(axum::middleware::from_fn_with_state(limiter, rate_limit::rate_limit_middleware))
        .layer(CorsLayer::permissive())
}
