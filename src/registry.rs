//! Hardcoded community registry: meters, tariff cycles, PV capacities,
//! sensor wiring, and the regulated tariff schedule.
//!
//! The per-meter data below is fabricated (locations are random points in
//! the Porto area, contracts do not belong to real households) and stands in
//! for a registry service that does not exist yet. Everything here is a
//! process-wide constant: the tables are built once at startup and never
//! mutated.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Selling to the retailer pays this fraction of the buy tariff.
pub const SELL_TARIFF_RATIO: f64 = 0.25;

/// Flat tariff applicable to self-consumed energy transiting the public
/// grid, in EUR/kWh, as published by the national regulator.
pub const SELF_CONSUMPTION_TARIFF: f64 = 0.027;

/// Default contracted power when the caller provides none: the maximum
/// low-voltage (BTN) contracted power, in kVA.
pub const DEFAULT_CONTRACTED_POWER_KVA: f64 = 41.4;

/// Dataset origin from which meter data is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetOrigin {
    #[serde(rename = "SEL")]
    Sel,
    #[serde(rename = "INDATA")]
    Indata,
}

impl fmt::Display for DatasetOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sel => write!(f, "SEL"),
            Self::Indata => write!(f, "INDATA"),
        }
    }
}

/// Regulated retail contract cycle (ERSE classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TariffCycle {
    /// Single rate at any hour.
    Simples,
    /// Two rates: off-peak 22:00–08:00, peak otherwise.
    BiHorarias,
    /// Three rates: off-peak 22:00–08:00, peak 09:00–11:00 and 18:00–21:00,
    /// half-peak otherwise.
    TriHorarias,
}

impl TariffCycle {
    /// Buy tariff in EUR/kWh for the given UTC timestamp.
    pub fn buy_tariff(&self, at: DateTime<Utc>) -> f64 {
        let hour = at.hour();
        match self {
            Self::Simples => 0.1529,
            Self::BiHorarias => {
                if (8..22).contains(&hour) {
                    0.1877
                } else {
                    0.1109
                }
            }
            Self::TriHorarias => {
                if !(8..22).contains(&hour) {
                    0.1072
                } else if (9..11).contains(&hour) || (18..21).contains(&hour) {
                    0.2559
                } else {
                    0.1682
                }
            }
        }
    }

    /// Sell tariff in EUR/kWh, a fixed fraction of the buy tariff.
    pub fn sell_tariff(&self, at: DateTime<Utc>) -> f64 {
        self.buy_tariff(at) * SELL_TARIFF_RATIO
    }
}

/// One sensor exposed by a SEL household installation.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    /// `MAIN_METER` for net consumption, `PV` for generation.
    pub device_type: &'static str,
    /// Sub-sensor index when the installation multiplexes several channels.
    pub sub_sensor: Option<&'static str>,
}

fn main_meter(sub: Option<&'static str>) -> SensorSpec {
    SensorSpec {
        device_type: "MAIN_METER",
        sub_sensor: sub,
    }
}

fn pv_sensor(sub: Option<&'static str>) -> SensorSpec {
    SensorSpec {
        device_type: "PV",
        sub_sensor: sub,
    }
}

/// Registry entry for a single meter.
#[derive(Debug, Clone)]
pub struct MeterEntry {
    /// Installed PV capacity in kWp; 0.0 means the meter has no panels and a
    /// modeled generation profile is used when a capacity is simulated.
    pub pv_kwp: f64,
    /// Retail contract cycle for the meter.
    pub cycle: TariffCycle,
    /// Phase carrying the net consumption reading (INDATA meters only).
    pub phase: Option<&'static str>,
    /// Sensors to query per request (SEL meters only).
    pub sensors: Vec<SensorSpec>,
}

impl MeterEntry {
    fn sel(pv_kwp: f64, cycle: TariffCycle, sensors: Vec<SensorSpec>) -> Self {
        Self {
            pv_kwp,
            cycle,
            phase: None,
            sensors,
        }
    }

    fn indata(cycle: TariffCycle, phase: &'static str) -> Self {
        Self {
            pv_kwp: 0.0,
            cycle,
            phase: Some(phase),
            sensors: Vec::new(),
        }
    }
}

/// Static description of one community (one dataset origin).
#[derive(Debug, Clone)]
pub struct Community {
    /// Location used for modeled PV profiles.
    pub latitude: f64,
    pub longitude: f64,
    /// Registered meters keyed by meter ID.
    pub meters: BTreeMap<&'static str, MeterEntry>,
    /// Tariff cycle assumed for simulated shared meters.
    pub shared_cycle: TariffCycle,
}

impl Community {
    /// Splits the requested IDs into registered and unknown ones.
    pub fn missing_ids<'a, I>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        ids.into_iter()
            .filter(|id| !self.meters.contains_key(id.as_str()))
            .cloned()
            .collect()
    }
}

/// All static configuration for both communities.
#[derive(Debug, Clone)]
pub struct Registry {
    sel: Community,
    indata: Community,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sel: sel_community(),
            indata: indata_community(),
        }
    }

    pub fn community(&self, origin: DatasetOrigin) -> &Community {
        match origin {
            DatasetOrigin::Sel => &self.sel,
            DatasetOrigin::Indata => &self.indata,
        }
    }
}

fn sel_community() -> Community {
    use TariffCycle::{BiHorarias, Simples, TriHorarias};

    let mut meters = BTreeMap::new();
    meters.insert(
        "00e61ee19628",
        MeterEntry::sel(0.0, Simples, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "05a92c8c62aa",
        MeterEntry::sel(0.0, BiHorarias, vec![main_meter(Some("2"))]),
    );
    meters.insert(
        "0c7886733863",
        MeterEntry::sel(6.0, TriHorarias, vec![main_meter(None), pv_sensor(Some("1"))]),
    );
    meters.insert(
        "170f37bdf13f",
        MeterEntry::sel(0.0, Simples, vec![main_meter(None)]),
    );
    meters.insert(
        "1a9defc4ff40",
        MeterEntry::sel(0.0, BiHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "1bb05aef72da",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "2e7aa1e3f706",
        MeterEntry::sel(9.2, Simples, vec![main_meter(Some("0")), pv_sensor(Some("1"))]),
    );
    meters.insert(
        "39bfae7af603",
        MeterEntry::sel(0.0, BiHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "3eab161b76b4",
        MeterEntry::sel(0.52, TriHorarias, vec![main_meter(Some("0")), pv_sensor(None)]),
    );
    meters.insert(
        "493ad0182e0c",
        MeterEntry::sel(0.0, Simples, vec![main_meter(Some("1"))]),
    );
    meters.insert(
        "4cbe01cb9cfd",
        MeterEntry::sel(0.68, BiHorarias, vec![main_meter(Some("0")), pv_sensor(Some("1"))]),
    );
    meters.insert(
        "4f1c99c0c199",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "6164e03bd2a7",
        MeterEntry::sel(1.28, Simples, vec![main_meter(None), pv_sensor(Some("0"))]),
    );
    meters.insert(
        "61fc5293fd52",
        MeterEntry::sel(0.0, BiHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "63aee2538cdc",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "704b6f864760",
        MeterEntry::sel(0.0, Simples, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "78c602cc58bb",
        MeterEntry::sel(0.0, BiHorarias, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "7ae273adbe80",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "8861e8af7053",
        MeterEntry::sel(0.0, Simples, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "8cc637b3bb53",
        MeterEntry::sel(0.0, BiHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "92eac9402957",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "94f356c4717c",
        MeterEntry::sel(8.0, Simples, vec![main_meter(Some("0")), pv_sensor(Some("1"))]),
    );
    meters.insert(
        "a76698a2563f",
        MeterEntry::sel(2.0, BiHorarias, vec![main_meter(None), pv_sensor(None)]),
    );
    meters.insert(
        "aa0ed5960c57",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "ad1fdca09bb0",
        MeterEntry::sel(0.0, Simples, vec![main_meter(None)]),
    );
    meters.insert(
        "b27a89d8336c",
        MeterEntry::sel(0.0, BiHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "bcb843d5c0c6",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "d1cbe72edcb6",
        MeterEntry::sel(0.0, Simples, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "d1e49ca67e63",
        MeterEntry::sel(36.0, BiHorarias, vec![main_meter(Some("0")), pv_sensor(None)]),
    );
    meters.insert(
        "dead79656d17",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(Some("2"))]),
    );
    meters.insert(
        "f3c07b9293f7",
        MeterEntry::sel(0.0, Simples, vec![main_meter(Some("0"))]),
    );
    meters.insert(
        "f4a53aae164a",
        MeterEntry::sel(0.0, BiHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "f4f44dd669e8",
        MeterEntry::sel(0.0, TriHorarias, vec![main_meter(None)]),
    );
    meters.insert(
        "fbe599917f4d",
        MeterEntry::sel(0.0, Simples, vec![main_meter(None)]),
    );

    Community {
        latitude: 41.158005,
        longitude: -8.663735,
        meters,
        shared_cycle: TariffCycle::Simples,
    }
}

fn indata_community() -> Community {
    use TariffCycle::{BiHorarias, Simples, TriHorarias};

    let mut meters = BTreeMap::new();
    meters.insert("0cb815fd4dec", MeterEntry::indata(Simples, "total"));
    meters.insert("0cb815fd4bcc", MeterEntry::indata(BiHorarias, "total"));
    meters.insert("0cb815fc5350", MeterEntry::indata(TriHorarias, "a"));
    meters.insert("0cb815fcc358", MeterEntry::indata(Simples, "a"));
    meters.insert("34987a685128", MeterEntry::indata(BiHorarias, "a"));
    meters.insert("0cb815fcc31c", MeterEntry::indata(TriHorarias, "total"));
    meters.insert("0cb815fcf5b4", MeterEntry::indata(Simples, "a"));
    meters.insert("0cb815fd15bc", MeterEntry::indata(BiHorarias, "total"));
    meters.insert("0cb815fd4b30", MeterEntry::indata(TriHorarias, "a"));
    meters.insert("0cb815fc72bc", MeterEntry::indata(Simples, "total"));
    meters.insert("0cb815fd3608", MeterEntry::indata(BiHorarias, "total"));
    meters.insert("34987a675924", MeterEntry::indata(TriHorarias, "total"));
    meters.insert("0cb815fcc220", MeterEntry::indata(Simples, "total"));
    meters.insert("0cb815fc6178", MeterEntry::indata(BiHorarias, "total"));
    meters.insert("0cb815fd1d38", MeterEntry::indata(TriHorarias, "total"));
    meters.insert("0cb815fd5654", MeterEntry::indata(Simples, "total"));
    meters.insert("0cb815fd534c", MeterEntry::indata(BiHorarias, "total"));
    meters.insert("34987a676138", MeterEntry::indata(TriHorarias, "total"));
    meters.insert("34987a675060", MeterEntry::indata(Simples, "total"));
    meters.insert("0cb815fd49c4", MeterEntry::indata(BiHorarias, "a"));

    Community {
        latitude: 41.151163,
        longitude: -8.652882,
        meters,
        shared_cycle: TariffCycle::Simples,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 16, hour, 0, 0).unwrap()
    }

    #[test]
    fn simples_is_flat() {
        let t0 = TariffCycle::Simples.buy_tariff(at(3));
        let t1 = TariffCycle::Simples.buy_tariff(at(19));
        assert_eq!(t0, t1);
    }

    #[test]
    fn bi_horarias_peak_exceeds_off_peak() {
        let off = TariffCycle::BiHorarias.buy_tariff(at(23));
        let peak = TariffCycle::BiHorarias.buy_tariff(at(12));
        assert!(peak > off);
    }

    #[test]
    fn tri_horarias_three_levels() {
        let off = TariffCycle::TriHorarias.buy_tariff(at(2));
        let half = TariffCycle::TriHorarias.buy_tariff(at(14));
        let peak = TariffCycle::TriHorarias.buy_tariff(at(19));
        assert!(off < half && half < peak);
    }

    #[test]
    fn sell_is_quarter_of_buy() {
        let buy = TariffCycle::BiHorarias.buy_tariff(at(12));
        let sell = TariffCycle::BiHorarias.sell_tariff(at(12));
        assert!((sell - buy * 0.25).abs() < 1e-12);
    }

    #[test]
    fn registry_has_both_communities() {
        let reg = Registry::new();
        assert_eq!(reg.community(DatasetOrigin::Sel).meters.len(), 34);
        assert_eq!(reg.community(DatasetOrigin::Indata).meters.len(), 20);
    }

    #[test]
    fn sel_meter_with_pv_lists_pv_sensor() {
        let reg = Registry::new();
        let entry = &reg.community(DatasetOrigin::Sel).meters["0c7886733863"];
        assert_eq!(entry.pv_kwp, 6.0);
        assert!(entry.sensors.iter().any(|s| s.device_type == "PV"));
    }

    #[test]
    fn missing_ids_flags_unknown_meters() {
        let reg = Registry::new();
        let ids = vec!["0cb815fd4dec".to_string(), "not-a-meter".to_string()];
        let missing = reg.community(DatasetOrigin::Indata).missing_ids(ids.iter());
        assert_eq!(missing, vec!["not-a-meter".to_string()]);
    }

    #[test]
    fn dataset_origin_serde_round_trip() {
        let sel: DatasetOrigin = serde_json::from_str("\"SEL\"").unwrap();
        assert_eq!(sel, DatasetOrigin::Sel);
        assert_eq!(serde_json::to_string(&DatasetOrigin::Indata).unwrap(), "\"INDATA\"");
    }
}
