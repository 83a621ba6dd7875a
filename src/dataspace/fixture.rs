//! In-memory data source for tests.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{MeterDataSource, RawMeterSeries};
use crate::error::Result;
use crate::registry::DatasetOrigin;
use crate::timeseries::Horizon;

/// Canned per-meter series, served regardless of origin. Vectors shorter
/// than the horizon are padded with missing intervals.
#[derive(Debug, Default, Clone)]
pub struct FixtureSource {
    meters: HashMap<String, (Vec<Option<f64>>, Vec<Option<f64>>)>,
    pv_factor: f64,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a meter from signed net loads in kWh: positive values are
    /// consumption, negative ones generation.
    pub fn with_net_load(mut self, meter_id: &str, net: Vec<f64>) -> Self {
        let e_c = net.iter().map(|v| Some(v.max(0.0))).collect();
        let e_g = net.iter().map(|v| Some((-v).max(0.0))).collect();
        self.meters.insert(meter_id.to_string(), (e_c, e_g));
        self
    }

    /// Registers a meter with explicit, possibly gappy series.
    pub fn with_series(
        mut self,
        meter_id: &str,
        e_c: Vec<Option<f64>>,
        e_g: Vec<Option<f64>>,
    ) -> Self {
        self.meters.insert(meter_id.to_string(), (e_c, e_g));
        self
    }

    /// Constant modeled PV factor, in kW per kWp.
    pub fn with_pv_factor(mut self, factor: f64) -> Self {
        self.pv_factor = factor;
        self
    }
}

#[async_trait]
impl MeterDataSource for FixtureSource {
    async fn fetch_meters(
        &self,
        _origin: DatasetOrigin,
        meter_ids: &[String],
        horizon: &Horizon,
    ) -> Result<Vec<RawMeterSeries>> {
        let steps = horizon.steps();
        Ok(meter_ids
            .iter()
            .filter_map(|meter_id| {
                self.meters.get(meter_id).map(|(e_c, e_g)| {
                    let mut e_c = e_c.clone();
                    let mut e_g = e_g.clone();
                    e_c.resize(steps, None);
                    e_g.resize(steps, None);
                    RawMeterSeries {
                        meter_id: meter_id.clone(),
                        e_c,
                        e_g,
                    }
                })
            })
            .collect())
    }

    async fn fetch_pv_profile(&self, _origin: DatasetOrigin, horizon: &Horizon) -> Result<Vec<f64>> {
        Ok(vec![self.pv_factor; horizon.steps()])
    }
}
