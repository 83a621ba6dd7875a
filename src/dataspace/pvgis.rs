//! Client for the PVGIS hourly irradiation service.
//!
//! Asks for the modeled output of a 1 kWp crystalline-silicon installation
//! at the community location, so the returned wattage doubles as a
//! generation factor. PVGIS only publishes data up to [`MAX_PVGIS_YEAR`];
//! later horizons reuse that year's profile.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use serde::Deserialize;

use crate::config::PvgisConfig;
use crate::error::{Error, Result};
use crate::timeseries::Horizon;

/// Newest year served by the PVGIS radiation databases.
pub const MAX_PVGIS_YEAR: i32 = 2023;

pub struct PvgisClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    outputs: SeriesOutputs,
}

#[derive(Debug, Deserialize)]
struct SeriesOutputs {
    hourly: Vec<HourlyPoint>,
}

#[derive(Debug, Deserialize)]
struct HourlyPoint {
    /// `YYYYMMDD:HHMM` timestamp.
    time: String,
    /// Modeled output power in W for the 1 kWp system.
    #[serde(rename = "P")]
    p: f64,
}

impl PvgisClient {
    pub fn new(config: &PvgisConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Generation factor per horizon interval, in kW per installed kWp.
    pub async fn hourly_factors(
        &self,
        latitude: f64,
        longitude: f64,
        horizon: &Horizon,
    ) -> Result<Vec<f64>> {
        let start_year = horizon.start().year().min(MAX_PVGIS_YEAR);
        let end_year = horizon.end().year().min(MAX_PVGIS_YEAR);

        let url = format!("{}/seriescalc", self.base_url);
        let response: SeriesResponse = self
            .client
            .get(&url)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("startyear", start_year.to_string()),
                ("endyear", end_year.to_string()),
                ("pvcalculation", "1".to_string()),
                ("peakpower", "1".to_string()),
                ("loss", "0".to_string()),
                ("angle", "0".to_string()),
                ("aspect", "0".to_string()),
                ("outputformat", "json".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let factors = index_hours(&response.outputs.hourly)?;
        Ok(horizon
            .timestamps()
            .into_iter()
            .map(|at| factor_for(&factors, at))
            .collect())
    }
}

type HourKey = (i32, u32, u32, u32);

fn index_hours(points: &[HourlyPoint]) -> Result<HashMap<HourKey, f64>> {
    let mut map = HashMap::with_capacity(points.len());
    for point in points {
        let parsed = NaiveDateTime::parse_from_str(&point.time, "%Y%m%d:%H%M")
            .map_err(|_| Error::payload(format!("unparsable PVGIS time: {}", point.time)))?;
        let key = (
            parsed.year(),
            parsed.month(),
            parsed.day(),
            parsed.hour(),
        );
        map.insert(key, point.p / 1000.0);
    }
    Ok(map)
}

/// Looks up the hour of `at`, reusing the newest published year for future
/// horizons. Hours absent from the published series (including a leap day
/// that the clamped year does not have) read as zero output.
fn factor_for(factors: &HashMap<HourKey, f64>, at: DateTime<Utc>) -> f64 {
    let year = at.year().min(MAX_PVGIS_YEAR);
    factors
        .get(&(year, at.month(), at.day(), at.hour()))
        .copied()
        .unwrap_or(0.0)
}
