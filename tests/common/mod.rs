//! Shared helpers for the API integration tests.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::util::ServiceExt;

use rec_lem_api::api::{AppState, router};
use rec_lem_api::config::MarketConfig;
use rec_lem_api::dataspace::fixture::FixtureSource;
use rec_lem_api::orders::OrderStore;
use rec_lem_api::registry::Registry;

/// Registered INDATA meters used by the fixtures.
pub const METER_A: &str = "0cb815fd4dec";
pub const METER_B: &str = "0cb815fd4bcc";
pub const METER_C: &str = "0cb815fc5350";

pub fn app_state(source: FixtureSource) -> Arc<AppState> {
    Arc::new(AppState {
        orders: OrderStore::new(),
        source: Arc::new(source),
        registry: Registry::new(),
        market: MarketConfig::default(),
    })
}

/// One buyer and one seller over `steps` quarter-hours.
pub fn two_meter_source(steps: usize) -> FixtureSource {
    FixtureSource::new()
        .with_net_load(METER_A, vec![1.0; steps])
        .with_net_load(METER_B, vec![-1.0; steps])
}

pub async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Polls a result endpoint until the order leaves the pending state.
pub async fn poll_until_done(
    state: &Arc<AppState>,
    uri_prefix: &str,
    order_id: &str,
) -> (StatusCode, Value) {
    for _ in 0..300 {
        let app = router(state.clone());
        let (status, body) = send(app, "GET", &format!("{uri_prefix}/{order_id}"), None).await;
        if status != StatusCode::ACCEPTED {
            return (status, body);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("order {order_id} never finished");
}
