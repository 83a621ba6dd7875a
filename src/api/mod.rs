//! REST surface for computing community schedules and market prices.
//!
//! POST endpoints register an order, spawn its worker, and answer
//! immediately with `202 Accepted` plus the order ID; GET endpoints poll
//! the order state.

pub mod handlers;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tracing::info;

use crate::config::MarketConfig;
use crate::dataspace::MeterDataSource;
use crate::orders::OrderStore;
use crate::registry::Registry;

/// Application state shared across request handlers and workers.
pub struct AppState {
    /// Registered orders and their outcomes.
    pub orders: OrderStore,
    /// Dataspace access.
    pub source: Arc<dyn MeterDataSource>,
    /// Static community configuration.
    pub registry: Registry,
    /// Market computation tuning.
    pub market: MarketConfig,
}

/// Builds the axum router with all API routes.
///
/// POST and GET share the parameterized paths (`/vanilla/{..}` takes a
/// pricing mechanism on POST and an order ID on GET; `/loop/{..}/{..}`
/// takes organization/mechanism on POST and organization/order ID on GET),
/// so each verb is registered on one merged route.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/vanilla/{value}",
            post(handlers::create_vanilla).get(handlers::get_vanilla),
        )
        .route("/dual", post(handlers::create_dual))
        .route("/dual/{order_id}", get(handlers::get_dual))
        .route(
            "/loop/{organization}/{value}",
            post(handlers::create_loop).get(handlers::get_loop),
        )
        .with_state(state)
}

/// Binds to the given address and serves the API.
///
/// # Panics
///
/// Panics if the TCP listener cannot bind to `addr`.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {addr}: {e}"));
    info!("listening on http://{addr}");
    axum::serve(listener, app)
        .await
        .unwrap_or_else(|e| panic!("server error: {e}"));
}
