//! Connector tests against mocked upstream services.

use chrono::{TimeZone, Utc};
use httpmock::prelude::*;
use serde_json::json;

use rec_lem_api::config::{DataspaceConfig, IndataConfig, PvgisConfig, SelConfig};
use rec_lem_api::dataspace::indata::IndataConnector;
use rec_lem_api::dataspace::pvgis::PvgisClient;
use rec_lem_api::dataspace::sel::SelConnector;
use rec_lem_api::dataspace::{LiveDataSource, MeterDataSource};
use rec_lem_api::registry::{DatasetOrigin, Registry, SensorSpec};
use rec_lem_api::timeseries::Horizon;

fn horizon() -> Horizon {
    Horizon::new(
        Utc.with_ymd_and_hms(2024, 5, 16, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 5, 16, 0, 30, 0).unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn indata_connector_filters_units_and_chunks_windows() {
    let server = MockServer::start();
    let metering = server.mock(|when, then| {
        when.method(GET)
            .path("/metering/energy")
            .query_param("shelly_id", "0cb815fd4dec")
            .query_param("phase", "total")
            .query_param("parameter", "active_power");
        then.status(200).json_body(json!({
            "data": [
                {"datetime": "2024-05-16T00:05:00Z", "value": 800.0, "unit": "W"},
                {"datetime": "2024-05-16T00:06:00Z", "value": 12.0, "unit": "kWh"},
                {"datetime": "2024-05-16T00:20:00Z", "value": 400.0, "unit": "W"}
            ]
        }));
    });

    let connector = IndataConnector::new(&IndataConfig {
        base_url: server.base_url(),
        endpoint: "/metering/energy".to_string(),
        token: "test-token".to_string(),
    });
    let samples = connector
        .fetch_meter("0cb815fd4dec", "total", &horizon())
        .await
        .unwrap();

    // The buffered 60' range is covered by three 25'-or-shorter windows,
    // each returning the same canned body; the kWh row is dropped.
    assert_eq!(metering.hits(), 3);
    assert!(samples.iter().all(|s| s.value == 800.0 || s.value == 400.0));
    assert_eq!(samples.len(), 6);
}

#[tokio::test]
async fn indata_connector_sends_token_header() {
    let server = MockServer::start();
    let metering = server.mock(|when, then| {
        when.method(GET)
            .path("/metering/energy")
            .header("Authorization", "Token sesame");
        then.status(200).json_body(json!({"data": []}));
    });

    let connector = IndataConnector::new(&IndataConfig {
        base_url: server.base_url(),
        endpoint: "/metering/energy".to_string(),
        token: "sesame".to_string(),
    });
    let samples = connector
        .fetch_meter("0cb815fd4dec", "total", &horizon())
        .await
        .unwrap();
    assert!(samples.is_empty());
    assert!(metering.hits() > 0);
}

#[tokio::test]
async fn sel_connector_authenticates_then_fetches_sensors() {
    let server = MockServer::start();
    let token = server.mock(|when, then| {
        when.method(POST).path("/api/token/");
        then.status(200).json_body(json!({"access": "jwt-token"}));
    });
    let main_meter = server.mock(|when, then| {
        when.method(GET)
            .path("/api/fetch-data")
            .header("access-token", "jwt-token")
            .query_param("participant_permanent_code", "0c7886733863")
            .query_param("device_type", "MAIN_METER");
        then.status(200).json_body(json!({
            "data": {"MAIN_METER": [
                {"datetime": "2024-05-16T00:05:00Z", "energy": 40.0},
                {"datetime": "2024-05-16T00:06:00Z", "energy": 35.0}
            ]}
        }));
    });
    let pv = server.mock(|when, then| {
        when.method(GET)
            .path("/api/fetch-data")
            .query_param("device_type", "PV");
        then.status(200).json_body(json!({
            "data": {"PV": {"1": [
                {"datetime": "2024-05-16T00:05:00Z", "energy": 120.0}
            ]}}
        }));
    });

    let connector = SelConnector::new(&SelConfig {
        base_url: server.base_url(),
        token_url: server.url("/api/token/"),
        email: "ops@example.org".to_string(),
        password: "secret".to_string(),
    });
    let sensors = vec![
        SensorSpec {
            device_type: "MAIN_METER",
            sub_sensor: None,
        },
        SensorSpec {
            device_type: "PV",
            sub_sensor: Some("1"),
        },
    ];
    let (consumption, generation) = connector
        .fetch_meter("0c7886733863", &sensors, &horizon())
        .await
        .unwrap();

    assert_eq!(token.hits(), 1);
    assert!(main_meter.hits() > 0);
    assert!(pv.hits() > 0);
    assert!(consumption.iter().all(|s| s.value == 40.0 || s.value == 35.0));
    assert!(generation.iter().all(|s| s.value == 120.0));
}

#[tokio::test]
async fn pvgis_client_maps_hourly_output_to_intervals() {
    let server = MockServer::start();
    let series = server.mock(|when, then| {
        when.method(GET)
            .path("/seriescalc")
            .query_param("peakpower", "1")
            .query_param("outputformat", "json");
        then.status(200).json_body(json!({
            "outputs": {"hourly": [
                {"time": "20230516:0010", "P": 500.0},
                {"time": "20230516:0110", "P": 700.0}
            ]}
        }));
    });

    let client = PvgisClient::new(&PvgisConfig {
        base_url: server.base_url(),
    });
    let factors = client.hourly_factors(41.15, -8.65, &horizon()).await.unwrap();

    assert_eq!(series.hits(), 1);
    // Both intervals fall in hour 0 of the clamped 2023 profile.
    assert_eq!(factors, vec![0.5, 0.5]);
}

#[tokio::test]
async fn live_source_converts_power_to_interval_energy() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/metering/energy");
        then.status(200).json_body(json!({
            "data": [
                {"datetime": "2024-05-16T00:05:00Z", "value": -1000.0, "unit": "W"},
                {"datetime": "2024-05-16T00:20:00Z", "value": -1000.0, "unit": "W"}
            ]
        }));
    });

    let mut config = DataspaceConfig::default();
    config.indata = IndataConfig {
        base_url: server.base_url(),
        endpoint: "/metering/energy".to_string(),
        token: "t".to_string(),
    };
    let source = LiveDataSource::new(&config, Registry::new());
    let series = source
        .fetch_meters(
            DatasetOrigin::Indata,
            &["0cb815fd4dec".to_string()],
            &horizon(),
        )
        .await
        .unwrap();

    assert_eq!(series.len(), 1);
    // -1000 W over a quarter hour: 0.25 kWh of generation, no consumption.
    for (e_c, e_g) in series[0].e_c.iter().zip(&series[0].e_g) {
        assert_eq!(*e_c, Some(0.0));
        assert_eq!(*e_g, Some(0.25));
    }
}

#[tokio::test]
async fn upstream_error_propagates() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/metering/energy");
        then.status(500);
    });

    let connector = IndataConnector::new(&IndataConfig {
        base_url: server.base_url(),
        endpoint: "/metering/energy".to_string(),
        token: "t".to_string(),
    });
    let result = connector.fetch_meter("0cb815fd4dec", "total", &horizon()).await;
    assert!(result.is_err());
}
