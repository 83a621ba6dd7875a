//! Data acquisition from the dataspace connectors and assembly of the
//! per-meter horizon series fed to pricing and scheduling.

pub mod indata;
pub mod pvgis;
pub mod sel;

#[cfg(any(test, feature = "testkit"))]
pub mod fixture;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::DataspaceConfig;
use crate::error::{Error, Result};
use crate::registry::{Community, DatasetOrigin, Registry, SELF_CONSUMPTION_TARIFF};
use crate::timeseries::{Horizon, missing_timestamps, resample_mean, resample_sum};

/// Grid-aligned raw series for one meter; `None` marks unobserved intervals.
/// Energies in kWh per interval.
#[derive(Debug, Clone)]
pub struct RawMeterSeries {
    pub meter_id: String,
    pub e_c: Vec<Option<f64>>,
    pub e_g: Vec<Option<f64>>,
}

/// Seam towards the dataspace. The live implementation talks to the
/// connectors over HTTP; tests substitute an in-memory fixture.
#[async_trait]
pub trait MeterDataSource: Send + Sync {
    /// Fetches the metered series for the requested meters. Meters absent
    /// from the dataspace are simply not returned.
    async fn fetch_meters(
        &self,
        origin: DatasetOrigin,
        meter_ids: &[String],
        horizon: &Horizon,
    ) -> Result<Vec<RawMeterSeries>>;

    /// Modeled PV generation for a 1 kWp installation at the community
    /// location, in kW per interval.
    async fn fetch_pv_profile(&self, origin: DatasetOrigin, horizon: &Horizon) -> Result<Vec<f64>>;
}

/// Everything a computation request needs from the dataspace.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub origin: DatasetOrigin,
    pub horizon: Horizon,
    pub meter_ids: Vec<String>,
    /// Installed-capacity overrides for registered meters, kWp.
    pub pv_overrides: BTreeMap<String, f64>,
    /// Simulated community-owned meters.
    pub shared_meter_ids: Vec<String>,
    /// Installed capacities for the shared meters, kWp.
    pub shared_pv_overrides: BTreeMap<String, f64>,
}

/// One meter's series over the horizon, ready for computation.
#[derive(Debug, Clone)]
pub struct MeterData {
    pub meter_id: String,
    /// Consumption, kWh per interval.
    pub e_c: Vec<f64>,
    /// Generation, kWh per interval.
    pub e_g: Vec<f64>,
    /// Retail buy tariff, EUR/kWh per interval.
    pub buy_tariff: Vec<f64>,
    /// Retail sell tariff, EUR/kWh per interval.
    pub sell_tariff: Vec<f64>,
}

/// Assembled data for the whole community over the horizon.
#[derive(Debug, Clone)]
pub struct HorizonData {
    pub timestamps: Vec<DateTime<Utc>>,
    pub meters: Vec<MeterData>,
    /// Self-consumption grid tariff, EUR/kWh per interval.
    pub self_consumption_tariffs: Vec<f64>,
}

/// Fetches and assembles all data needed to answer a request.
///
/// Fails with [`Error::MeterIdsNotFound`] when meters are unknown to the
/// registry or absent from the dataspace, and with
/// [`Error::DataPointsMissing`] when intervals stay unobserved.
pub async fn fetch_horizon_data(
    source: &dyn MeterDataSource,
    registry: &Registry,
    request: &FetchRequest,
) -> Result<HorizonData> {
    let community = registry.community(request.origin);

    let unknown = community.missing_ids(request.meter_ids.iter());
    if !unknown.is_empty() {
        return Err(Error::MeterIdsNotFound(unknown));
    }

    info!(origin = %request.origin, meters = request.meter_ids.len(), "fetching dataspace series");
    let raw = source
        .fetch_meters(request.origin, &request.meter_ids, &request.horizon)
        .await?;

    let profile = if needs_pv_profile(request, community) {
        source.fetch_pv_profile(request.origin, &request.horizon).await?
    } else {
        vec![0.0; request.horizon.steps()]
    };

    assemble(request, community, raw, &profile)
}

/// The modeled profile is only needed when a PV-less or shared meter gets a
/// simulated installed capacity.
fn needs_pv_profile(request: &FetchRequest, community: &Community) -> bool {
    let simulated = request.meter_ids.iter().any(|id| {
        community
            .meters
            .get(id.as_str())
            .is_some_and(|entry| entry.pv_kwp == 0.0)
            && request.pv_overrides.get(id).copied().unwrap_or(0.0) > 0.0
    });
    let shared = request
        .shared_meter_ids
        .iter()
        .any(|id| request.shared_pv_overrides.get(id).copied().unwrap_or(0.0) > 0.0);
    simulated || shared
}

/// Builds the final per-meter series from raw dataspace data, applying PV
/// capacity scaling, tariff attachment, and missing-data detection.
pub fn assemble(
    request: &FetchRequest,
    community: &Community,
    raw: Vec<RawMeterSeries>,
    pv_profile: &[f64],
) -> Result<HorizonData> {
    let horizon = &request.horizon;
    let steps = horizon.steps();
    let timestamps = horizon.timestamps();
    let dt = horizon.dt_hours();

    let mut by_id: BTreeMap<&str, &RawMeterSeries> = BTreeMap::new();
    for series in &raw {
        by_id.insert(series.meter_id.as_str(), series);
    }

    // Meters that returned nothing at all are reported as not found; meters
    // with partial coverage contribute to the missing-data map instead.
    let mut absent = Vec::new();
    let mut gaps: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut meters = Vec::new();

    for meter_id in &request.meter_ids {
        let Some(entry) = community.meters.get(meter_id.as_str()) else {
            absent.push(meter_id.clone());
            continue;
        };
        let series = match by_id.get(meter_id.as_str()) {
            Some(series) if series.e_c.iter().any(Option::is_some) => *series,
            _ => {
                absent.push(meter_id.clone());
                continue;
            }
        };

        let missing = missing_timestamps(&series.e_c, horizon);
        if !missing.is_empty() {
            gaps.insert(meter_id.clone(), missing);
            continue;
        }

        let capacity = request
            .pv_overrides
            .get(meter_id)
            .copied()
            .unwrap_or(entry.pv_kwp);
        let e_g: Vec<f64> = (0..steps)
            .map(|t| {
                if entry.pv_kwp > 0.0 {
                    // Native generation rescaled to the simulated capacity.
                    series.e_g[t].unwrap_or(0.0) * capacity / entry.pv_kwp
                } else {
                    pv_profile[t] * capacity * dt
                }
            })
            .collect();

        meters.push(MeterData {
            meter_id: meter_id.clone(),
            e_c: series.e_c.iter().map(|v| v.unwrap_or(0.0)).collect(),
            e_g,
            buy_tariff: timestamps.iter().map(|at| entry.cycle.buy_tariff(*at)).collect(),
            sell_tariff: timestamps.iter().map(|at| entry.cycle.sell_tariff(*at)).collect(),
        });
    }

    if !absent.is_empty() {
        return Err(Error::MeterIdsNotFound(absent));
    }
    if !gaps.is_empty() {
        return Err(Error::DataPointsMissing(gaps));
    }

    for meter_id in &request.shared_meter_ids {
        let capacity = request
            .shared_pv_overrides
            .get(meter_id)
            .copied()
            .unwrap_or(0.0);
        meters.push(MeterData {
            meter_id: meter_id.clone(),
            e_c: vec![0.0; steps],
            e_g: pv_profile.iter().map(|factor| factor * capacity * dt).collect(),
            buy_tariff: timestamps
                .iter()
                .map(|at| community.shared_cycle.buy_tariff(*at))
                .collect(),
            sell_tariff: timestamps
                .iter()
                .map(|at| community.shared_cycle.sell_tariff(*at))
                .collect(),
        });
    }

    Ok(HorizonData {
        timestamps,
        meters,
        self_consumption_tariffs: vec![SELF_CONSUMPTION_TARIFF; steps],
    })
}

/// Live implementation backed by the two dataspace connectors and the PVGIS
/// service.
pub struct LiveDataSource {
    indata: indata::IndataConnector,
    sel: sel::SelConnector,
    pvgis: pvgis::PvgisClient,
    registry: Registry,
}

impl LiveDataSource {
    pub fn new(config: &DataspaceConfig, registry: Registry) -> Self {
        Self {
            indata: indata::IndataConnector::new(&config.indata),
            sel: sel::SelConnector::new(&config.sel),
            pvgis: pvgis::PvgisClient::new(&config.pvgis),
            registry,
        }
    }
}

#[async_trait]
impl MeterDataSource for LiveDataSource {
    async fn fetch_meters(
        &self,
        origin: DatasetOrigin,
        meter_ids: &[String],
        horizon: &Horizon,
    ) -> Result<Vec<RawMeterSeries>> {
        let community = self.registry.community(origin);
        let mut out = Vec::with_capacity(meter_ids.len());
        for meter_id in meter_ids {
            let Some(entry) = community.meters.get(meter_id.as_str()) else {
                continue;
            };
            let series = match origin {
                DatasetOrigin::Indata => {
                    let phase = entry.phase.unwrap_or("total");
                    let samples = self.indata.fetch_meter(meter_id, phase, horizon).await?;
                    if samples.is_empty() {
                        continue;
                    }
                    // Mean power in W per interval becomes energy in kWh;
                    // positive net load is consumption, negative generation.
                    let net = resample_mean(&samples, horizon);
                    RawMeterSeries {
                        meter_id: meter_id.clone(),
                        e_c: net
                            .iter()
                            .map(|v| v.map(|w| (w * horizon.dt_hours() / 1000.0).max(0.0)))
                            .collect(),
                        e_g: net
                            .iter()
                            .map(|v| v.map(|w| (-w * horizon.dt_hours() / 1000.0).max(0.0)))
                            .collect(),
                    }
                }
                DatasetOrigin::Sel => {
                    let (consumption, generation) =
                        self.sel.fetch_meter(meter_id, &entry.sensors, horizon).await?;
                    if consumption.is_empty() {
                        continue;
                    }
                    // Per-minute energies in Wh are summed per interval.
                    RawMeterSeries {
                        meter_id: meter_id.clone(),
                        e_c: resample_sum(&consumption, horizon)
                            .iter()
                            .map(|v| v.map(|wh| wh / 1000.0))
                            .collect(),
                        e_g: resample_sum(&generation, horizon)
                            .iter()
                            .map(|v| v.map(|wh| wh / 1000.0))
                            .collect(),
                    }
                }
            };
            out.push(series);
        }
        Ok(out)
    }

    async fn fetch_pv_profile(&self, origin: DatasetOrigin, horizon: &Horizon) -> Result<Vec<f64>> {
        let community = self.registry.community(origin);
        self.pvgis
            .hourly_factors(community.latitude, community.longitude, horizon)
            .await
    }
}

/// Human-readable description of a missing-data map, used in failure
/// messages.
pub fn describe_gaps(gaps: &BTreeMap<String, Vec<String>>) -> String {
    let parts: Vec<String> = gaps
        .iter()
        .map(|(meter_id, stamps)| format!("{meter_id}: [{}]", stamps.join(", ")))
        .collect();
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn horizon() -> Horizon {
        let start = Utc.with_ymd_and_hms(2024, 5, 16, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 16, 1, 0, 0).unwrap();
        Horizon::new(start, end).unwrap()
    }

    fn request(meter_ids: Vec<&str>) -> FetchRequest {
        FetchRequest {
            origin: DatasetOrigin::Indata,
            horizon: horizon(),
            meter_ids: meter_ids.into_iter().map(String::from).collect(),
            pv_overrides: BTreeMap::new(),
            shared_meter_ids: Vec::new(),
            shared_pv_overrides: BTreeMap::new(),
        }
    }

    fn series(meter_id: &str, e_c: Vec<Option<f64>>) -> RawMeterSeries {
        let e_g = vec![Some(0.0); e_c.len()];
        RawMeterSeries {
            meter_id: meter_id.to_string(),
            e_c,
            e_g,
        }
    }

    #[test]
    fn assemble_attaches_cycle_tariffs() {
        let registry = Registry::new();
        let community = registry.community(DatasetOrigin::Indata);
        let req = request(vec!["0cb815fd4dec"]);
        let raw = vec![series("0cb815fd4dec", vec![Some(0.2); 4])];
        let data = assemble(&req, community, raw, &[0.0; 4]).unwrap();
        assert_eq!(data.meters.len(), 1);
        assert_eq!(data.meters[0].e_c, vec![0.2; 4]);
        // Cycle "simples" is flat.
        assert!(data.meters[0].buy_tariff.iter().all(|t| *t == 0.1529));
        assert!(
            data.meters[0]
                .sell_tariff
                .iter()
                .zip(&data.meters[0].buy_tariff)
                .all(|(s, b)| (s - b * 0.25).abs() < 1e-12)
        );
    }

    #[test]
    fn assemble_reports_absent_meters() {
        let registry = Registry::new();
        let community = registry.community(DatasetOrigin::Indata);
        let req = request(vec!["0cb815fd4dec", "0cb815fd4bcc"]);
        let raw = vec![series("0cb815fd4dec", vec![Some(0.2); 4])];
        let err = assemble(&req, community, raw, &[0.0; 4]).unwrap_err();
        match err {
            Error::MeterIdsNotFound(ids) => assert_eq!(ids, vec!["0cb815fd4bcc".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn assemble_reports_partial_gaps() {
        let registry = Registry::new();
        let community = registry.community(DatasetOrigin::Indata);
        let req = request(vec!["0cb815fd4dec"]);
        let raw = vec![series("0cb815fd4dec", vec![Some(0.2), None, None, Some(0.2)])];
        let err = assemble(&req, community, raw, &[0.0; 4]).unwrap_err();
        match err {
            Error::DataPointsMissing(gaps) => {
                let missing = &gaps["0cb815fd4dec"];
                assert_eq!(
                    missing,
                    &vec![
                        "2024-05-16T00:15:00Z".to_string(),
                        "2024-05-16T00:30:00Z".to_string()
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pv_override_scales_modeled_profile() {
        let registry = Registry::new();
        let community = registry.community(DatasetOrigin::Indata);
        let mut req = request(vec!["0cb815fd4dec"]);
        req.pv_overrides.insert("0cb815fd4dec".to_string(), 4.0);
        let raw = vec![series("0cb815fd4dec", vec![Some(0.2); 4])];
        // 0.5 kW per kWp over a quarter hour with 4 kWp -> 0.5 kWh.
        let data = assemble(&req, community, raw, &[0.5; 4]).unwrap();
        assert!(data.meters[0].e_g.iter().all(|g| (g - 0.5).abs() < 1e-12));
    }

    #[test]
    fn native_pv_rescales_with_capacity_ratio() {
        let registry = Registry::new();
        let community = registry.community(DatasetOrigin::Sel);
        let mut req = request(vec!["0c7886733863"]);
        req.origin = DatasetOrigin::Sel;
        // Registered at 6 kWp, simulated at 12 kWp: measured output doubles.
        req.pv_overrides.insert("0c7886733863".to_string(), 12.0);
        let raw = vec![RawMeterSeries {
            meter_id: "0c7886733863".to_string(),
            e_c: vec![Some(0.1); 4],
            e_g: vec![Some(0.3); 4],
        }];
        let data = assemble(&req, community, raw, &[0.0; 4]).unwrap();
        assert!(data.meters[0].e_g.iter().all(|g| (g - 0.6).abs() < 1e-12));
    }

    #[test]
    fn shared_meters_consume_nothing_and_follow_profile() {
        let registry = Registry::new();
        let community = registry.community(DatasetOrigin::Indata);
        let mut req = request(vec!["0cb815fd4dec"]);
        req.shared_meter_ids.push("community-pv".to_string());
        req.shared_pv_overrides.insert("community-pv".to_string(), 2.0);
        let raw = vec![series("0cb815fd4dec", vec![Some(0.2); 4])];
        let data = assemble(&req, community, raw, &[0.8; 4]).unwrap();
        let shared = data.meters.iter().find(|m| m.meter_id == "community-pv").unwrap();
        assert!(shared.e_c.iter().all(|c| *c == 0.0));
        assert!(shared.e_g.iter().all(|g| (g - 0.4).abs() < 1e-12));
    }

    #[test]
    fn unknown_registry_id_detected_before_fetch() {
        let registry = Registry::new();
        let community = registry.community(DatasetOrigin::Indata);
        let req = request(vec!["nope"]);
        let missing = community.missing_ids(req.meter_ids.iter());
        assert_eq!(missing, vec!["nope".to_string()]);
    }
}
