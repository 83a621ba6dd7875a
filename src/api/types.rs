//! Request and response schemas of the REST surface.
//!
//! Field names and status semantics mirror the published API contract; all
//! datetimes are ISO 8601 and normalized to UTC on the way in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataspace::FetchRequest;
use crate::market::milp::MilpStatus;
use crate::registry::DatasetOrigin;
use crate::timeseries::Horizon;

// REQUEST SCHEMAS ----------------------------------------------------------

/// Per-meter installed PV capacity override, in kWp.
#[derive(Debug, Clone, Deserialize)]
pub struct PvCapacity {
    pub meter_id: String,
    pub installed_pv_capacity: f64,
}

/// Per-meter storage parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageParams {
    pub meter_id: String,
    /// Energy capacity, kWh.
    pub e_bn: f64,
    /// Maximum charge/discharge power, kW.
    pub p_max: f64,
    /// Minimum state of charge, %.
    pub soc_min: f64,
    /// Maximum state of charge, %.
    pub soc_max: f64,
    /// Charging efficiency, %.
    pub eff_bc: f64,
    /// Discharging efficiency, %.
    pub eff_bd: f64,
    /// Degradation cost, EUR/kWh.
    pub deg_cost: f64,
}

/// Per-meter contracted power, in kVA.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractedPower {
    pub meter_id: String,
    pub contracted_power: f64,
}

/// Parameters shared by every computation request.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseParams {
    /// Start of the computation horizon (included), ISO 8601.
    pub start_datetime: DateTime<Utc>,
    /// End of the computation horizon (excluded), ISO 8601.
    pub end_datetime: DateTime<Utc>,
    pub dataset_origin: DatasetOrigin,
    /// Meters forming the community; at least two.
    pub meter_ids: BTreeSet<String>,
    #[serde(default)]
    pub meter_installed_pv_capacities: Vec<PvCapacity>,
    /// Simulated community-owned meters.
    #[serde(default)]
    pub shared_meter_ids: BTreeSet<String>,
    #[serde(default)]
    pub shared_meter_installed_pv_capacities: Vec<PvCapacity>,
}

/// Pricing-mechanism tuning shared by vanilla and loop requests.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingParams {
    /// Surplus-interval incentive for the `sdr` mechanism, 0.0 to 1.0.
    #[serde(default)]
    pub sdr_compensation: f64,
    /// Divisor of the `mmr` expression; above 2 favors buyers.
    #[serde(default = "default_mmr_divisor")]
    pub mmr_divisor: f64,
}

fn default_mmr_divisor() -> f64 {
    2.0
}

impl Default for PricingParams {
    fn default() -> Self {
        Self {
            sdr_compensation: 0.0,
            mmr_divisor: default_mmr_divisor(),
        }
    }
}

/// Storage and contracted-power overrides for scheduling requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MilpParams {
    #[serde(default)]
    pub meter_storage: Vec<StorageParams>,
    #[serde(default)]
    pub shared_meter_storage: Vec<StorageParams>,
    #[serde(default)]
    pub meter_contracted_power: Vec<ContractedPower>,
    #[serde(default)]
    pub shared_meter_contracted_power: Vec<ContractedPower>,
}

/// Body of `POST /vanilla/{pricing_mechanism}`.
#[derive(Debug, Clone, Deserialize)]
pub struct VanillaRequest {
    #[serde(flatten)]
    pub base: BaseParams,
    #[serde(flatten)]
    pub pricing: PricingParams,
}

/// Body of `POST /dual`.
#[derive(Debug, Clone, Deserialize)]
pub struct DualRequest {
    #[serde(flatten)]
    pub base: BaseParams,
    #[serde(flatten)]
    pub milp: MilpParams,
}

/// Body of `POST /loop/{lem_organization}/{pricing_mechanism}`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopRequest {
    #[serde(flatten)]
    pub base: BaseParams,
    #[serde(flatten)]
    pub milp: MilpParams,
    #[serde(flatten)]
    pub pricing: PricingParams,
}

// VALIDATION ---------------------------------------------------------------

/// One rejected request field.
#[derive(Debug, Clone, Serialize)]
pub struct ParamError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn param_error(field: &str, message: impl Into<String>) -> ParamError {
    ParamError {
        field: field.to_string(),
        message: message.into(),
    }
}

impl BaseParams {
    /// The validated computation horizon.
    pub fn horizon(&self) -> Result<Horizon, ParamError> {
        Horizon::new(self.start_datetime, self.end_datetime)
            .map_err(|message| param_error("end_datetime", message))
    }

    pub fn validate(&self) -> Vec<ParamError> {
        let mut errors = Vec::new();
        if let Err(e) = self.horizon() {
            errors.push(e);
        }
        if self.meter_ids.len() < 2 {
            errors.push(param_error(
                "meter_ids",
                "please define at least 2 meters for the community",
            ));
        }
        for pv in &self.meter_installed_pv_capacities {
            if !self.meter_ids.contains(&pv.meter_id) {
                errors.push(param_error(
                    "meter_installed_pv_capacities",
                    format!("meter_id \"{}\" not found in field meter_ids", pv.meter_id),
                ));
            }
            if pv.installed_pv_capacity < 0.0 {
                errors.push(param_error(
                    "meter_installed_pv_capacities",
                    "installed_pv_capacity must be >= 0",
                ));
            }
        }
        for pv in &self.shared_meter_installed_pv_capacities {
            if !self.shared_meter_ids.contains(&pv.meter_id) {
                errors.push(param_error(
                    "shared_meter_installed_pv_capacities",
                    format!(
                        "meter_id \"{}\" not found in field shared_meter_ids",
                        pv.meter_id
                    ),
                ));
            }
            if pv.installed_pv_capacity < 0.0 {
                errors.push(param_error(
                    "shared_meter_installed_pv_capacities",
                    "installed_pv_capacity must be >= 0",
                ));
            }
        }
        errors
    }

    /// Converts the validated parameters into a dataspace fetch request.
    pub fn fetch_request(&self) -> Result<FetchRequest, ParamError> {
        Ok(FetchRequest {
            origin: self.dataset_origin,
            horizon: self.horizon()?,
            meter_ids: self.meter_ids.iter().cloned().collect(),
            pv_overrides: capacity_map(&self.meter_installed_pv_capacities),
            shared_meter_ids: self.shared_meter_ids.iter().cloned().collect(),
            shared_pv_overrides: capacity_map(&self.shared_meter_installed_pv_capacities),
        })
    }
}

fn capacity_map(overrides: &[PvCapacity]) -> BTreeMap<String, f64> {
    overrides
        .iter()
        .map(|pv| (pv.meter_id.clone(), pv.installed_pv_capacity))
        .collect()
}

impl PricingParams {
    pub fn validate(&self) -> Vec<ParamError> {
        let mut errors = Vec::new();
        if !(0.0..=1.0).contains(&self.sdr_compensation) {
            errors.push(param_error("sdr_compensation", "must be in [0.0, 1.0]"));
        }
        if self.mmr_divisor <= 0.0 {
            errors.push(param_error("mmr_divisor", "must be > 0"));
        }
        errors
    }
}

impl MilpParams {
    pub fn validate(&self, base: &BaseParams) -> Vec<ParamError> {
        let mut errors = Vec::new();
        validate_storage(&self.meter_storage, &base.meter_ids, "meter_storage", &mut errors);
        validate_storage(
            &self.shared_meter_storage,
            &base.shared_meter_ids,
            "shared_meter_storage",
            &mut errors,
        );
        validate_contracted(
            &self.meter_contracted_power,
            &base.meter_ids,
            "meter_contracted_power",
            &mut errors,
        );
        validate_contracted(
            &self.shared_meter_contracted_power,
            &base.shared_meter_ids,
            "shared_meter_contracted_power",
            &mut errors,
        );
        errors
    }
}

fn validate_storage(
    entries: &[StorageParams],
    ids: &BTreeSet<String>,
    field: &str,
    errors: &mut Vec<ParamError>,
) {
    for st in entries {
        if !ids.contains(&st.meter_id) {
            errors.push(param_error(
                field,
                format!("meter_id \"{}\" not found in the corresponding ID list", st.meter_id),
            ));
        }
        if st.e_bn < 0.0 || st.p_max < 0.0 || st.deg_cost < 0.0 {
            errors.push(param_error(field, "e_bn, p_max and deg_cost must be >= 0"));
        }
        if !(0.0..=100.0).contains(&st.soc_min) || !(0.0..=100.0).contains(&st.soc_max) {
            errors.push(param_error(field, "soc_min and soc_max must be in [0.0, 100.0]"));
        }
        if st.soc_max < st.soc_min {
            errors.push(param_error(field, "soc_max < soc_min"));
        }
        for (name, eff) in [("eff_bc", st.eff_bc), ("eff_bd", st.eff_bd)] {
            if !(eff > 0.0 && eff <= 100.0) {
                errors.push(param_error(field, format!("{name} must be in (0.0, 100.0]")));
            }
        }
    }
}

fn validate_contracted(
    entries: &[ContractedPower],
    ids: &BTreeSet<String>,
    field: &str,
    errors: &mut Vec<ParamError>,
) {
    for cp in entries {
        if !ids.contains(&cp.meter_id) {
            errors.push(param_error(
                field,
                format!("meter_id \"{}\" not found in the corresponding ID list", cp.meter_id),
            ));
        }
        if cp.contracted_power < 0.0 {
            errors.push(param_error(field, "contracted_power must be >= 0"));
        }
    }
}

impl VanillaRequest {
    pub fn validate(&self) -> Vec<ParamError> {
        let mut errors = self.base.validate();
        errors.extend(self.pricing.validate());
        errors
    }
}

impl DualRequest {
    pub fn validate(&self) -> Vec<ParamError> {
        let mut errors = self.base.validate();
        errors.extend(self.milp.validate(&self.base));
        errors
    }
}

impl LoopRequest {
    pub fn validate(&self) -> Vec<ParamError> {
        let mut errors = self.base.validate();
        errors.extend(self.milp.validate(&self.base));
        errors.extend(self.pricing.validate());
        errors
    }
}

// RESPONSE SCHEMAS ---------------------------------------------------------

/// Immediate response to every POST.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedBody {
    pub message: String,
    pub order_id: String,
}

/// Status-only response used for 202/404/412/422/500 on the GET endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusBody {
    pub message: String,
    pub order_id: String,
}

/// Validation rejection body for malformed request parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationErrorBody {
    pub errors: Vec<ParamError>,
}

/// Market price for one interval.
#[derive(Debug, Clone, Serialize)]
pub struct PricePoint {
    pub datetime: DateTime<Utc>,
    /// EUR/kWh.
    pub value: f64,
}

/// Buying or selling side of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferSide {
    Buy,
    Sell,
}

/// One offer considered in a market session.
#[derive(Debug, Clone, Serialize)]
pub struct OfferRecord {
    pub datetime: DateTime<Utc>,
    pub meter_id: String,
    /// kWh.
    pub amount: f64,
    /// EUR/kWh.
    pub value: f64,
    #[serde(rename = "type")]
    pub side: OfferSide,
}

/// Result payload of a vanilla order.
#[derive(Debug, Clone, Serialize)]
pub struct VanillaOutputs {
    pub order_id: String,
    pub lem_prices: Vec<PricePoint>,
    pub offers: Vec<OfferRecord>,
}

/// Time-varying inputs fed to the scheduling problem, per meter.
#[derive(Debug, Clone, Serialize)]
pub struct MeterInputRecord {
    pub meter_id: String,
    pub datetime: DateTime<Utc>,
    /// kWh.
    pub energy_generated: f64,
    /// kWh.
    pub energy_consumed: f64,
    /// EUR/kWh.
    pub buy_tariff: f64,
    /// EUR/kWh.
    pub sell_tariff: f64,
}

/// Scheduled operation, per meter and interval.
#[derive(Debug, Clone, Serialize)]
pub struct MeterOutputRecord {
    pub meter_id: String,
    pub datetime: DateTime<Utc>,
    /// Sold to the retailer, kWh.
    pub energy_surplus: f64,
    /// Bought from the retailer, kWh.
    pub energy_supplied: f64,
    /// Net load after BESS operation, kWh.
    pub net_load: f64,
    /// 0.0 when the meter has no storage.
    pub bess_energy_charged: f64,
    pub bess_energy_discharged: f64,
    pub bess_energy_content: f64,
}

/// Pool market settlement, per meter and interval.
#[derive(Debug, Clone, Serialize)]
pub struct PoolTransaction {
    pub meter_id: String,
    pub datetime: DateTime<Utc>,
    pub energy_purchased_lem: f64,
    pub energy_sold_lem: f64,
    /// Sold minus purchased, kWh.
    pub sold_position: f64,
}

/// Bilateral market settlement, per pair and interval.
#[derive(Debug, Clone, Serialize)]
pub struct BilateralTransaction {
    pub provider_meter_id: String,
    pub receiver_meter_id: String,
    pub datetime: DateTime<Utc>,
    /// kWh.
    pub energy: f64,
}

/// Horizon operation cost per meter, excluding BESS degradation.
#[derive(Debug, Clone, Serialize)]
pub struct IndividualCost {
    pub meter_id: String,
    /// EUR.
    pub individual_cost: f64,
}

/// Self-consumption tariff applied to pool purchases.
#[derive(Debug, Clone, Serialize)]
pub struct PoolScTariff {
    pub datetime: DateTime<Utc>,
    /// EUR/kWh.
    pub self_consumption_tariff: f64,
}

/// Self-consumption tariff applied to one bilateral pair.
#[derive(Debug, Clone, Serialize)]
pub struct BilateralScTariff {
    pub datetime: DateTime<Utc>,
    pub provider_meter_id: String,
    pub receiver_meter_id: String,
    /// EUR/kWh.
    pub self_consumption_tariff: f64,
}

/// Result payload of dual orders and pool-organized loop orders.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMilpOutputs {
    pub order_id: String,
    pub objective_value: f64,
    pub milp_status: MilpStatus,
    /// EUR.
    pub total_rec_cost: f64,
    pub individual_costs: Vec<IndividualCost>,
    pub meter_inputs: Vec<MeterInputRecord>,
    pub meter_outputs: Vec<MeterOutputRecord>,
    pub lem_transactions: Vec<PoolTransaction>,
    pub lem_prices: Vec<PricePoint>,
    pub self_consumption_tariffs: Vec<PoolScTariff>,
}

/// Result payload of bilateral-organized loop orders.
#[derive(Debug, Clone, Serialize)]
pub struct BilateralMilpOutputs {
    pub order_id: String,
    pub objective_value: f64,
    pub milp_status: MilpStatus,
    /// EUR.
    pub total_rec_cost: f64,
    pub individual_costs: Vec<IndividualCost>,
    pub meter_inputs: Vec<MeterInputRecord>,
    pub meter_outputs: Vec<MeterOutputRecord>,
    pub lem_transactions: Vec<BilateralTransaction>,
    pub lem_prices: Vec<PricePoint>,
    pub self_consumption_tariffs: Vec<BilateralScTariff>,
}
