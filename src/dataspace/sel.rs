//! Connector for the Smart Energy Lab back office.
//!
//! Access is granted per request batch: a bearer token is obtained with the
//! configured account, then one request per day and per sensor retrieves
//! minute-level energy readings (Wh). Consumption comes from the
//! `MAIN_METER` device type, generation from `PV` when installed; some
//! installations multiplex channels behind a sub-sensor index.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::SelConfig;
use crate::error::{Error, Result};
use crate::registry::SensorSpec;
use crate::timeseries::{Horizon, Sample};

pub struct SelConnector {
    client: reqwest::Client,
    base_url: String,
    token_url: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
}

impl SelConnector {
    pub fn new(config: &SelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            email: config.email.clone(),
            password: config.password.clone(),
        }
    }

    async fn fetch_token(&self) -> Result<String> {
        let response: TokenResponse = self
            .client
            .post(&self.token_url)
            .form(&[("email", self.email.as_str()), ("password", self.password.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.access)
    }

    /// Fetches consumption and generation samples for one meter over the
    /// buffered horizon. Days or sensors without data contribute nothing.
    pub async fn fetch_meter(
        &self,
        meter_id: &str,
        sensors: &[SensorSpec],
        horizon: &Horizon,
    ) -> Result<(Vec<Sample>, Vec<Sample>)> {
        let token = self.fetch_token().await?;
        let url = format!("{}/api/fetch-data", self.base_url);
        let (start, end) = horizon.buffered();

        let mut consumption = Vec::new();
        let mut generation = Vec::new();

        let mut day = start.date_naive();
        let last_day = end.date_naive();
        while day <= last_day {
            for sensor in sensors {
                debug!(meter_id, %day, sensor = sensor.device_type, "daily sensor request");
                let start_date = day.format("%Y-%m-%d").to_string();
                let body: Value = self
                    .client
                    .get(&url)
                    .header("access-token", &token)
                    .query(&[
                        ("request_type", "fetch"),
                        ("participant_permanent_code", meter_id),
                        ("start_date", start_date.as_str()),
                        ("device_type", sensor.device_type),
                        ("access_token", token.as_str()),
                    ])
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;

                let samples = extract_samples(&body, sensor)?;
                match sensor.device_type {
                    "PV" => generation.extend(samples),
                    _ => consumption.extend(samples),
                }
            }
            day = day + Duration::days(1);
        }
        Ok((consumption, generation))
    }
}

/// Digs the sample list out of the response, following the sub-sensor index
/// when configured and falling back to the first channel when the index is
/// not announced upstream.
fn extract_samples(body: &Value, sensor: &SensorSpec) -> Result<Vec<Sample>> {
    let Some(node) = body.get("data").and_then(|data| data.get(sensor.device_type)) else {
        return Ok(Vec::new());
    };

    let list = match node {
        Value::Array(_) => node,
        Value::Object(channels) => {
            let picked = sensor
                .sub_sensor
                .and_then(|sub| channels.get(sub))
                .or_else(|| channels.values().next());
            match picked {
                Some(value) => value,
                None => return Ok(Vec::new()),
            }
        }
        Value::Null => return Ok(Vec::new()),
        _ => return Err(Error::payload("sensor data is neither a list nor channels")),
    };

    let Some(rows) = list.as_array() else {
        return Ok(Vec::new());
    };

    let mut samples = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(raw_dt) = row.get("datetime").and_then(Value::as_str) else {
            continue;
        };
        let Some(energy) = row.get("energy").and_then(Value::as_f64) else {
            continue;
        };
        // Readings are stamped at the end of their minute.
        let at = parse_timestamp(raw_dt)? - Duration::minutes(1);
        samples.push(Sample { at, value: energy });
    }
    Ok(samples)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::payload(format!("unparsable timestamp: {raw}")))
}
