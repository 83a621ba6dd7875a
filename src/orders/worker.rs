//! Background resolution of registered orders.
//!
//! One task per order: fetch the horizon data, run the requested
//! computation, and park the outcome in the order store for the GET
//! endpoints to pick up.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use super::{FailureKind, OrderResult};
use crate::api::AppState;
use crate::api::types::{
    BilateralMilpOutputs, BilateralScTariff, BilateralTransaction, DualRequest, IndividualCost,
    LoopRequest, MeterInputRecord, MeterOutputRecord, OfferRecord, OfferSide, PoolMilpOutputs,
    PoolScTariff, PoolTransaction, PricePoint, VanillaOutputs, VanillaRequest,
};
use crate::dataspace::{HorizonData, describe_gaps, fetch_horizon_data};
use crate::error::{Error, Result};
use crate::market::iterative::{self, LoopSettings};
use crate::market::milp::{self, CollectiveProblem, CollectiveSolution, MeterSpec, StorageSpec};
use crate::market::{
    LemOrganization, OfferBook, PricingKnobs, PricingMechanism, offer_book, pricing, round2, round3,
};
use crate::registry::DEFAULT_CONTRACTED_POWER_KVA;

/// Resolves a vanilla order.
pub async fn run_vanilla(
    state: Arc<AppState>,
    order_id: String,
    mechanism: PricingMechanism,
    request: VanillaRequest,
) {
    let outcome = compute_vanilla(&state, &order_id, mechanism, &request).await;
    settle_order(&state, &order_id, outcome);
}

/// Resolves a dual order.
pub async fn run_dual(state: Arc<AppState>, order_id: String, request: DualRequest) {
    let outcome = compute_dual(&state, &order_id, &request).await;
    settle_order(&state, &order_id, outcome);
}

/// Resolves a loop order.
pub async fn run_loop(
    state: Arc<AppState>,
    order_id: String,
    organization: LemOrganization,
    mechanism: PricingMechanism,
    request: LoopRequest,
) {
    let outcome = compute_loop(&state, &order_id, organization, mechanism, &request).await;
    settle_order(&state, &order_id, outcome);
}

fn settle_order(state: &AppState, order_id: &str, outcome: Result<OrderResult>) {
    match outcome {
        Ok(result) => {
            info!(order_id, "order processed");
            state.orders.complete(order_id, result);
        }
        Err(Error::MeterIdsNotFound(ids)) => {
            warn!(order_id, ?ids, "meter IDs missing");
            state.orders.fail(
                order_id,
                FailureKind::MetersNotFound,
                format!("One or more meter IDs not found on registry system: {ids:?}"),
            );
        }
        Err(Error::DataPointsMissing(gaps)) => {
            warn!(order_id, "data points missing");
            state.orders.fail(
                order_id,
                FailureKind::DataPointsMissing,
                format!(
                    "One or more data point for one or more meter IDs not found on registry system: {}",
                    describe_gaps(&gaps)
                ),
            );
        }
        Err(e) => {
            error!(order_id, error = %e, "order failed");
            state.orders.fail(order_id, FailureKind::Internal, e.to_string());
        }
    }
}

async fn compute_vanilla(
    state: &AppState,
    order_id: &str,
    mechanism: PricingMechanism,
    request: &VanillaRequest,
) -> Result<OrderResult> {
    let fetch = request
        .base
        .fetch_request()
        .map_err(|e| Error::Config { message: e.to_string() })?;
    let data = fetch_horizon_data(state.source.as_ref(), &state.registry, &fetch).await?;
    let knobs = knobs_for(state, request.pricing.sdr_compensation, request.pricing.mmr_divisor);

    let mut lem_prices = Vec::with_capacity(data.timestamps.len());
    let mut offers = Vec::new();
    for (t, at) in data.timestamps.iter().enumerate() {
        let book: OfferBook = offer_book(data.meters.iter().map(|m| {
            (
                m.meter_id.as_str(),
                m.e_c[t] - m.e_g[t],
                m.buy_tariff[t],
                m.sell_tariff[t],
            )
        }));
        let price = pricing::settle(mechanism, &book, &knobs);
        lem_prices.push(PricePoint {
            datetime: *at,
            value: round3(price),
        });
        for offer in &book.buys {
            offers.push(OfferRecord {
                datetime: *at,
                meter_id: offer.origin.clone(),
                amount: round3(offer.amount),
                value: round3(offer.value),
                side: OfferSide::Buy,
            });
        }
        for offer in &book.sells {
            offers.push(OfferRecord {
                datetime: *at,
                meter_id: offer.origin.clone(),
                amount: round3(offer.amount),
                value: round3(offer.value),
                side: OfferSide::Sell,
            });
        }
    }

    Ok(OrderResult::Vanilla(VanillaOutputs {
        order_id: order_id.to_string(),
        lem_prices,
        offers,
    }))
}

async fn compute_dual(
    state: &AppState,
    order_id: &str,
    request: &DualRequest,
) -> Result<OrderResult> {
    let fetch = request
        .base
        .fetch_request()
        .map_err(|e| Error::Config { message: e.to_string() })?;
    let horizon = fetch.horizon;
    let data = fetch_horizon_data(state.source.as_ref(), &state.registry, &fetch).await?;
    let problem = build_problem(&data, &request.milp, horizon.dt_hours());

    info!(order_id, meters = problem.meters.len(), steps = problem.steps(), "solving collective problem");
    let (problem, solution, prices) = tokio::task::spawn_blocking(move || -> Result<_> {
        let solution = milp::solve_pool(&problem)?;
        let prices = milp::pool_shadow_prices(&problem, &solution)?;
        Ok((problem, solution, prices))
    })
    .await
    .map_err(|e| Error::Solver { message: e.to_string() })??;

    Ok(OrderResult::PoolMilp(pool_outputs(
        order_id, &data, &problem, &solution, &prices,
    )))
}

async fn compute_loop(
    state: &AppState,
    order_id: &str,
    organization: LemOrganization,
    mechanism: PricingMechanism,
    request: &LoopRequest,
) -> Result<OrderResult> {
    let fetch = request
        .base
        .fetch_request()
        .map_err(|e| Error::Config { message: e.to_string() })?;
    let horizon = fetch.horizon;
    let data = fetch_horizon_data(state.source.as_ref(), &state.registry, &fetch).await?;
    let problem = build_problem(&data, &request.milp, horizon.dt_hours());
    let settings = LoopSettings {
        mechanism,
        knobs: knobs_for(state, request.pricing.sdr_compensation, request.pricing.mmr_divisor),
        max_iterations: state.market.max_iterations,
        convergence_eps: state.market.convergence_eps,
    };

    info!(order_id, organization = organization.as_str(), mechanism = mechanism.as_str(), "running iterative pricing");
    let (problem, outcome) = tokio::task::spawn_blocking(move || -> Result<_> {
        let outcome = iterative::run(&problem, organization, &settings)?;
        Ok((problem, outcome))
    })
    .await
    .map_err(|e| Error::Solver { message: e.to_string() })??;
    info!(order_id, iterations = outcome.iterations, deviation = outcome.deviation, "pricing loop done");

    match organization {
        LemOrganization::Pool => Ok(OrderResult::PoolMilp(pool_outputs(
            order_id,
            &data,
            &problem,
            &outcome.solution,
            &outcome.prices,
        ))),
        LemOrganization::Bilateral => Ok(OrderResult::BilateralMilp(bilateral_outputs(
            order_id,
            &data,
            &problem,
            &outcome.solution,
            &outcome.prices,
        ))),
    }
}

fn knobs_for(state: &AppState, sdr_compensation: f64, mmr_divisor: f64) -> PricingKnobs {
    PricingKnobs {
        mmr_divisor,
        sdr_compensation,
        crossing_increment: state.market.crossing_increment,
    }
}

/// Builds the collective problem from assembled data plus the request's
/// storage and contracted-power overrides.
fn build_problem(data: &HorizonData, milp: &crate::api::types::MilpParams, dt_hours: f64) -> CollectiveProblem {
    let mut storage: BTreeMap<&str, StorageSpec> = BTreeMap::new();
    for st in milp.meter_storage.iter().chain(&milp.shared_meter_storage) {
        storage.insert(
            st.meter_id.as_str(),
            StorageSpec {
                capacity_kwh: st.e_bn,
                p_max_kw: st.p_max,
                soc_min_pct: st.soc_min,
                soc_max_pct: st.soc_max,
                eff_charge_pct: st.eff_bc,
                eff_discharge_pct: st.eff_bd,
                degradation_cost: st.deg_cost,
            },
        );
    }
    let mut contracted: BTreeMap<&str, f64> = BTreeMap::new();
    for cp in milp
        .meter_contracted_power
        .iter()
        .chain(&milp.shared_meter_contracted_power)
    {
        contracted.insert(cp.meter_id.as_str(), cp.contracted_power);
    }

    CollectiveProblem {
        dt_hours,
        meters: data
            .meters
            .iter()
            .map(|m| MeterSpec {
                meter_id: m.meter_id.clone(),
                e_c: m.e_c.clone(),
                e_g: m.e_g.clone(),
                buy_tariff: m.buy_tariff.clone(),
                sell_tariff: m.sell_tariff.clone(),
                max_power_kw: contracted
                    .get(m.meter_id.as_str())
                    .copied()
                    .unwrap_or(DEFAULT_CONTRACTED_POWER_KVA),
                storage: storage.get(m.meter_id.as_str()).copied(),
            })
            .collect(),
        grid_tariffs: data.self_consumption_tariffs.clone(),
    }
}

fn costs_records(
    problem: &CollectiveProblem,
    solution: &CollectiveSolution,
    prices: &[f64],
) -> (Vec<IndividualCost>, f64) {
    let costs = milp::individual_costs(problem, solution, prices);
    let total = round2(costs.iter().map(|(_, c)| *c).sum::<f64>());
    let records = costs
        .into_iter()
        .map(|(meter_id, cost)| IndividualCost {
            meter_id,
            individual_cost: round2(cost),
        })
        .collect();
    (records, total)
}

fn meter_records(
    data: &HorizonData,
    problem: &CollectiveProblem,
    solution: &CollectiveSolution,
) -> (Vec<MeterInputRecord>, Vec<MeterOutputRecord>) {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for (t, at) in data.timestamps.iter().enumerate() {
        for (meter, schedule) in problem.meters.iter().zip(&solution.meters) {
            inputs.push(MeterInputRecord {
                meter_id: meter.meter_id.clone(),
                datetime: *at,
                energy_generated: round3(meter.e_g[t]),
                energy_consumed: round3(meter.e_c[t]),
                buy_tariff: round3(meter.buy_tariff[t]),
                sell_tariff: round3(meter.sell_tariff[t]),
            });
            outputs.push(MeterOutputRecord {
                meter_id: meter.meter_id.clone(),
                datetime: *at,
                energy_surplus: round3(schedule.surplus[t]),
                energy_supplied: round3(schedule.supplied[t]),
                net_load: round3(schedule.net_load[t]),
                bess_energy_charged: round3(schedule.charged[t]),
                bess_energy_discharged: round3(schedule.discharged[t]),
                bess_energy_content: round3(schedule.content[t]),
            });
        }
    }
    (inputs, outputs)
}

fn price_records(data: &HorizonData, prices: &[f64]) -> Vec<PricePoint> {
    data.timestamps
        .iter()
        .zip(prices)
        .map(|(at, price)| PricePoint {
            datetime: *at,
            value: round3(*price),
        })
        .collect()
}

fn pool_outputs(
    order_id: &str,
    data: &HorizonData,
    problem: &CollectiveProblem,
    solution: &CollectiveSolution,
    prices: &[f64],
) -> PoolMilpOutputs {
    let (individual_costs, total_rec_cost) = costs_records(problem, solution, prices);
    let (meter_inputs, meter_outputs) = meter_records(data, problem, solution);

    let mut lem_transactions = Vec::new();
    let mut self_consumption_tariffs = Vec::new();
    for (t, at) in data.timestamps.iter().enumerate() {
        self_consumption_tariffs.push(PoolScTariff {
            datetime: *at,
            self_consumption_tariff: round3(data.self_consumption_tariffs[t]),
        });
        for schedule in &solution.meters {
            lem_transactions.push(PoolTransaction {
                meter_id: schedule.meter_id.clone(),
                datetime: *at,
                energy_purchased_lem: round3(schedule.purchased[t]),
                energy_sold_lem: round3(schedule.sold[t]),
                sold_position: round3(schedule.sold[t] - schedule.purchased[t]),
            });
        }
    }

    PoolMilpOutputs {
        order_id: order_id.to_string(),
        objective_value: round2(solution.objective_value),
        milp_status: solution.status,
        total_rec_cost,
        individual_costs,
        meter_inputs,
        meter_outputs,
        lem_transactions,
        lem_prices: price_records(data, prices),
        self_consumption_tariffs,
    }
}

fn bilateral_outputs(
    order_id: &str,
    data: &HorizonData,
    problem: &CollectiveProblem,
    solution: &CollectiveSolution,
    prices: &[f64],
) -> BilateralMilpOutputs {
    let (individual_costs, total_rec_cost) = costs_records(problem, solution, prices);
    let (meter_inputs, meter_outputs) = meter_records(data, problem, solution);

    let mut lem_transactions = Vec::new();
    let mut self_consumption_tariffs = Vec::new();
    for (t, at) in data.timestamps.iter().enumerate() {
        for trade in &solution.pair_trades {
            lem_transactions.push(BilateralTransaction {
                provider_meter_id: trade.provider.clone(),
                receiver_meter_id: trade.receiver.clone(),
                datetime: *at,
                energy: round3(trade.energy[t]),
            });
            self_consumption_tariffs.push(BilateralScTariff {
                datetime: *at,
                provider_meter_id: trade.provider.clone(),
                receiver_meter_id: trade.receiver.clone(),
                self_consumption_tariff: round3(data.self_consumption_tariffs[t]),
            });
        }
    }

    BilateralMilpOutputs {
        order_id: order_id.to_string(),
        objective_value: round2(solution.objective_value),
        milp_status: solution.status,
        total_rec_cost,
        individual_costs,
        meter_inputs,
        meter_outputs,
        lem_transactions,
        lem_prices: price_records(data, prices),
        self_consumption_tariffs,
    }
}
