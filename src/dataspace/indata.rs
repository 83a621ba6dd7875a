//! Connector for the IN-DATA living-lab metering endpoint.
//!
//! The upstream serves signed active-power samples (W) per shelly and
//! phase. Requests are limited to 1500 points and the granularity can be
//! one second, so the horizon is split into 25-minute windows.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::config::IndataConfig;
use crate::error::Result;
use crate::timeseries::{Horizon, Sample};

const WINDOW_MINUTES: i64 = 25;

pub struct IndataConnector {
    client: reqwest::Client,
    base_url: String,
    endpoint: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct MeteringResponse {
    #[serde(default)]
    data: Vec<MeteringPoint>,
}

#[derive(Debug, Deserialize)]
struct MeteringPoint {
    datetime: DateTime<Utc>,
    value: f64,
    unit: String,
}

impl IndataConnector {
    pub fn new(config: &IndataConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            endpoint: config.endpoint.clone(),
            token: config.token.clone(),
        }
    }

    /// Fetches the net active-power samples for one meter over the buffered
    /// horizon. Only `W` readings are kept; energy rows that may be mixed in
    /// are dropped.
    pub async fn fetch_meter(
        &self,
        meter_id: &str,
        phase: &str,
        horizon: &Horizon,
    ) -> Result<Vec<Sample>> {
        let (start, end) = horizon.buffered();
        let url = format!("{}{}", self.base_url, self.endpoint);

        let mut samples = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let window_end = (cursor + Duration::minutes(WINDOW_MINUTES)).min(end);
            debug!(meter_id, %cursor, %window_end, "metering window request");
            let start_date = format_request_ts(cursor);
            let end_date = format_request_ts(window_end);
            let response: MeteringResponse = self
                .client
                .get(&url)
                .header("Authorization", format!("Token {}", self.token))
                .query(&[
                    ("shelly_id", meter_id),
                    ("phase", phase),
                    ("parameter", "active_power"),
                    ("start_date", start_date.as_str()),
                    ("end_date", end_date.as_str()),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            samples.extend(
                response
                    .data
                    .into_iter()
                    .filter(|point| point.unit == "W")
                    .map(|point| Sample {
                        at: point.datetime,
                        value: point.value,
                    }),
            );
            cursor = window_end;
        }
        Ok(samples)
    }
}

fn format_request_ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn request_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 16, 0, 15, 0).unwrap();
        assert_eq!(format_request_ts(at), "2024-05-16T00:15:00Z");
    }

    #[test]
    fn metering_point_parses_upstream_shape() {
        let raw = r#"{"data": [{"datetime": "2024-05-16T00:00:05Z", "value": -320.5, "unit": "W"}]}"#;
        let parsed: MeteringResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.len(), 1);
        assert_eq!(parsed.data[0].value, -320.5);
    }
}
