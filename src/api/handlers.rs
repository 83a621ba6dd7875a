//! Request handlers for the API endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::info;

use super::AppState;
use super::types::{
    AcceptedBody, DualRequest, LoopRequest, ParamError, StatusBody, ValidationErrorBody,
    VanillaRequest,
};
use crate::market::{LemOrganization, PricingMechanism};
use crate::orders::{self, FailureKind, OrderKind, OrderResult, OrderStatus, worker};

const ACCEPTED_MESSAGE: &str = "Processing has started. Use the order ID for status updates.";
const NOT_PROCESSED_MESSAGE: &str = "Order found but not yet processed.";
const NOT_FOUND_MESSAGE: &str = "Order not found.";

/// `POST /vanilla/{pricing_mechanism}` — price a horizon with the selected
/// mechanism, without scheduling. Returns 202 with the order ID.
pub async fn create_vanilla(
    State(state): State<Arc<AppState>>,
    Path(mechanism): Path<PricingMechanism>,
    Json(request): Json<VanillaRequest>,
) -> Response {
    if let Err(response) = validated(request.validate()) {
        return response;
    }
    let order_id = orders::new_order_id();
    info!(%order_id, mechanism = mechanism.as_str(), "vanilla order registered");
    state.orders.register(
        &order_id,
        OrderKind::Vanilla,
        LemOrganization::Pool,
        Some(mechanism),
    );
    tokio::spawn(worker::run_vanilla(
        state.clone(),
        order_id.clone(),
        mechanism,
        request,
    ));
    accepted(order_id)
}

/// `GET /vanilla/{order_id}` — result of a vanilla order.
pub async fn get_vanilla(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Response {
    order_response(&state, &order_id, OrderKind::Vanilla, None)
}

/// `POST /dual` — schedule the community and derive prices from the market
/// equilibrium duals. Returns 202 with the order ID.
pub async fn create_dual(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DualRequest>,
) -> Response {
    if let Err(response) = validated(request.validate()) {
        return response;
    }
    let order_id = orders::new_order_id();
    info!(%order_id, "dual order registered");
    state
        .orders
        .register(&order_id, OrderKind::Dual, LemOrganization::Pool, None);
    tokio::spawn(worker::run_dual(state.clone(), order_id.clone(), request));
    accepted(order_id)
}

/// `GET /dual/{order_id}` — result of a dual order.
pub async fn get_dual(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Response {
    order_response(&state, &order_id, OrderKind::Dual, Some(LemOrganization::Pool))
}

/// `POST /loop/{lem_organization}/{pricing_mechanism}` — iterative pricing
/// plus scheduling. Returns 202 with the order ID.
pub async fn create_loop(
    State(state): State<Arc<AppState>>,
    Path((organization, mechanism)): Path<(LemOrganization, PricingMechanism)>,
    Json(request): Json<LoopRequest>,
) -> Response {
    if let Err(response) = validated(request.validate()) {
        return response;
    }
    let order_id = orders::new_order_id();
    info!(
        %order_id,
        organization = organization.as_str(),
        mechanism = mechanism.as_str(),
        "loop order registered"
    );
    state
        .orders
        .register(&order_id, OrderKind::Loop, organization, Some(mechanism));
    tokio::spawn(worker::run_loop(
        state.clone(),
        order_id.clone(),
        organization,
        mechanism,
        request,
    ));
    accepted(order_id)
}

/// `GET /loop/{lem_organization}/{order_id}` — result of a loop order under
/// the given market organization.
pub async fn get_loop(
    State(state): State<Arc<AppState>>,
    Path((organization, order_id)): Path<(String, String)>,
) -> Response {
    let organization = match organization.as_str() {
        "pool" => LemOrganization::Pool,
        "bilateral" => LemOrganization::Bilateral,
        _ => return not_found(&order_id),
    };
    order_response(&state, &order_id, OrderKind::Loop, Some(organization))
}

fn accepted(order_id: String) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedBody {
            message: ACCEPTED_MESSAGE.to_string(),
            order_id,
        }),
    )
        .into_response()
}

fn validated(errors: Vec<ParamError>) -> Result<(), Response> {
    if errors.is_empty() {
        return Ok(());
    }
    Err((
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ValidationErrorBody { errors }),
    )
        .into_response())
}

fn not_found(order_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(StatusBody {
            message: NOT_FOUND_MESSAGE.to_string(),
            order_id: order_id.to_string(),
        }),
    )
        .into_response()
}

fn status_response(code: StatusCode, message: String, order_id: &str) -> Response {
    (
        code,
        Json(StatusBody {
            message,
            order_id: order_id.to_string(),
        }),
    )
        .into_response()
}

/// Maps an order record onto the response contract: 404 for unknown or
/// differently-typed orders, 202 while pending, 412/422/500 for failures,
/// 200 with the payload once processed.
fn order_response(
    state: &AppState,
    order_id: &str,
    kind: OrderKind,
    organization: Option<LemOrganization>,
) -> Response {
    let Some(record) = state.orders.get(order_id) else {
        return not_found(order_id);
    };
    if record.kind != kind || organization.is_some_and(|org| record.organization != org) {
        return not_found(order_id);
    }

    match record.status {
        OrderStatus::Pending => {
            status_response(StatusCode::ACCEPTED, NOT_PROCESSED_MESSAGE.to_string(), order_id)
        }
        OrderStatus::Failed { kind: failure, message } => {
            let code = match failure {
                FailureKind::MetersNotFound => StatusCode::PRECONDITION_FAILED,
                FailureKind::DataPointsMissing => StatusCode::UNPROCESSABLE_ENTITY,
                FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            };
            status_response(code, message, order_id)
        }
        OrderStatus::Completed(result) => match *result {
            OrderResult::Vanilla(outputs) => (StatusCode::OK, Json(outputs)).into_response(),
            OrderResult::PoolMilp(outputs) => (StatusCode::OK, Json(outputs)).into_response(),
            OrderResult::BilateralMilp(outputs) => (StatusCode::OK, Json(outputs)).into_response(),
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::util::ServiceExt;

    use super::*;
    use crate::api::router;
    use crate::config::MarketConfig;
    use crate::dataspace::fixture::FixtureSource;
    use crate::orders::OrderStore;
    use crate::registry::Registry;

    const METER_A: &str = "0cb815fd4dec";
    const METER_B: &str = "0cb815fd4bcc";

    fn test_state() -> Arc<AppState> {
        let source = FixtureSource::new()
            .with_net_load(METER_A, vec![1.0, 0.5])
            .with_net_load(METER_B, vec![-1.0, -0.5]);
        Arc::new(AppState {
            orders: OrderStore::new(),
            source: Arc::new(source),
            registry: Registry::new(),
            market: MarketConfig::default(),
        })
    }

    fn vanilla_body() -> Value {
        json!({
            "start_datetime": "2024-05-16T00:00:00Z",
            "end_datetime": "2024-05-16T00:30:00Z",
            "dataset_origin": "INDATA",
            "meter_ids": [METER_A, METER_B]
        })
    }

    async fn send(app: axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder().method(method).uri(uri).body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        // Extractor rejections answer with plain text, not JSON.
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn poll_until_done(state: &Arc<AppState>, uri_prefix: &str, order_id: &str) -> (StatusCode, Value) {
        for _ in 0..200 {
            let app = router(state.clone());
            let (status, body) = send(app, "GET", &format!("{uri_prefix}/{order_id}"), None).await;
            if status != StatusCode::ACCEPTED {
                return (status, body);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("order {order_id} never finished");
    }

    #[tokio::test]
    async fn vanilla_round_trip() {
        let state = test_state();
        let (status, body) = send(
            router(state.clone()),
            "POST",
            "/vanilla/mmr",
            Some(vanilla_body()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let order_id = body["order_id"].as_str().unwrap().to_string();
        assert_eq!(order_id.len(), 60);
        assert_eq!(body["message"], ACCEPTED_MESSAGE);

        let (status, result) = poll_until_done(&state, "/vanilla", &order_id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["order_id"], order_id.as_str());
        assert_eq!(result["lem_prices"].as_array().unwrap().len(), 2);
        assert!(!result["offers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_order_is_404() {
        let state = test_state();
        let (status, body) = send(router(state), "GET", "/vanilla/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], NOT_FOUND_MESSAGE);
    }

    #[tokio::test]
    async fn invalid_body_is_422_with_field_errors() {
        let state = test_state();
        let mut body = vanilla_body();
        body["meter_ids"] = json!([METER_A]);
        let (status, response) = send(router(state), "POST", "/vanilla/sdr", Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response["errors"][0]["field"], "meter_ids");
    }

    #[tokio::test]
    async fn unknown_mechanism_is_rejected() {
        let state = test_state();
        let (status, _) = send(router(state), "POST", "/vanilla/vickrey", Some(vanilla_body())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn vanilla_order_is_not_visible_as_dual() {
        let state = test_state();
        let (_, body) = send(
            router(state.clone()),
            "POST",
            "/vanilla/mmr",
            Some(vanilla_body()),
        )
        .await;
        let order_id = body["order_id"].as_str().unwrap().to_string();

        let (status, _) = send(router(state), "GET", &format!("/dual/{order_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_meter_reports_412() {
        let state = test_state();
        let mut body = vanilla_body();
        // Registered meter with no data in the fixture dataspace.
        body["meter_ids"] = json!([METER_A, "0cb815fc5350"]);
        let (_, response) = send(router(state.clone()), "POST", "/vanilla/mmr", Some(body)).await;
        let order_id = response["order_id"].as_str().unwrap().to_string();

        let (status, result) = poll_until_done(&state, "/vanilla", &order_id).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert!(result["message"].as_str().unwrap().contains("0cb815fc5350"));
    }

    #[tokio::test]
    async fn dual_round_trip_reports_schedule() {
        let state = test_state();
        let (status, body) = send(
            router(state.clone()),
            "POST",
            "/dual",
            Some(vanilla_body()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let order_id = body["order_id"].as_str().unwrap().to_string();

        let (status, result) = poll_until_done(&state, "/dual", &order_id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["milp_status"], "Optimal");
        assert_eq!(result["meter_outputs"].as_array().unwrap().len(), 4);
        assert_eq!(result["lem_prices"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn loop_pool_round_trip() {
        let state = test_state();
        let (status, body) = send(
            router(state.clone()),
            "POST",
            "/loop/pool/crossing_value",
            Some(vanilla_body()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let order_id = body["order_id"].as_str().unwrap().to_string();

        let (status, result) = poll_until_done(&state, "/loop/pool", &order_id).await;
        assert_eq!(status, StatusCode::OK);
        assert!(result["lem_transactions"].as_array().is_some());

        // The same order is not visible under the bilateral organization.
        let (status, _) = send(
            router(state),
            "GET",
            &format!("/loop/bilateral/{order_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
