//! Iterative price discovery.
//!
//! Each round solves one scheduling problem per meter against the current
//! price vector, rebuilds the interval offers from the scheduled net loads,
//! and settles new prices with the selected mechanism. The loop stops when
//! the largest price movement falls below the convergence threshold or the
//! iteration cap is reached; the final prices then feed one collective solve
//! that produces the reported schedule and transactions.

use tracing::debug;

use super::milp::{self, CollectiveProblem, CollectiveSolution, MeterSchedule, MilpStatus};
use super::{LemOrganization, OfferBook, PricingKnobs, PricingMechanism, offer_book, pricing};
use crate::error::Result;

/// Tuning of the iterative algorithm.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub mechanism: PricingMechanism,
    pub knobs: PricingKnobs,
    /// Hard cap on pricing rounds.
    pub max_iterations: usize,
    /// Largest per-interval price movement considered converged, EUR/kWh.
    pub convergence_eps: f64,
}

/// Result of the iterative algorithm.
#[derive(Debug)]
pub struct LoopOutcome {
    pub solution: CollectiveSolution,
    /// Final price per interval, EUR/kWh.
    pub prices: Vec<f64>,
    /// Pricing rounds actually run.
    pub iterations: usize,
    /// Last observed maximum price movement.
    pub deviation: f64,
}

/// Runs the iterative price discovery and the final collective solve.
pub fn run(
    problem: &CollectiveProblem,
    organization: LemOrganization,
    settings: &LoopSettings,
) -> Result<LoopOutcome> {
    let steps = problem.steps();

    // Round zero: offers straight from the metered net loads, before any
    // scheduling reacts to prices.
    let raw_schedules: Vec<MeterSchedule> = problem
        .meters
        .iter()
        .map(|m| MeterSchedule {
            meter_id: m.meter_id.clone(),
            supplied: vec![0.0; steps],
            surplus: vec![0.0; steps],
            net_load: (0..steps).map(|t| m.e_c[t] - m.e_g[t]).collect(),
            charged: vec![0.0; steps],
            discharged: vec![0.0; steps],
            content: vec![0.0; steps],
            purchased: vec![0.0; steps],
            sold: vec![0.0; steps],
        })
        .collect();
    let mut prices = settle_from_schedules(problem, &raw_schedules, settings);
    let mut deviation = f64::INFINITY;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        iterations += 1;
        let schedules = individual_schedules(problem, &prices)?;
        let next = settle_from_schedules(problem, &schedules, settings);
        deviation = prices
            .iter()
            .zip(&next)
            .map(|(old, new)| (old - new).abs())
            .fold(0.0, f64::max);
        prices = next;
        debug!(iteration = iterations, deviation, "pricing round settled");
        if deviation < settings.convergence_eps {
            break;
        }
    }

    let solution = match organization {
        LemOrganization::Pool => milp::solve_pool(problem)?,
        LemOrganization::Bilateral => milp::solve_bilateral(problem)?,
    };
    if solution.status != MilpStatus::Optimal {
        prices = vec![0.0; steps];
    }

    Ok(LoopOutcome {
        solution,
        prices,
        iterations,
        deviation,
    })
}

fn individual_schedules(
    problem: &CollectiveProblem,
    prices: &[f64],
) -> Result<Vec<MeterSchedule>> {
    problem
        .meters
        .iter()
        .map(|meter| milp::solve_individual(meter, problem.dt_hours, &problem.grid_tariffs, prices))
        .collect()
}

/// Settles every interval from the schedules' net loads.
fn settle_from_schedules(
    problem: &CollectiveProblem,
    schedules: &[MeterSchedule],
    settings: &LoopSettings,
) -> Vec<f64> {
    (0..problem.steps())
        .map(|t| {
            let book: OfferBook = offer_book(problem.meters.iter().zip(schedules).map(
                |(m, schedule)| {
                    (
                        m.meter_id.as_str(),
                        schedule.net_load[t],
                        m.buy_tariff[t],
                        m.sell_tariff[t],
                    )
                },
            ));
            pricing::settle(settings.mechanism, &book, &settings.knobs)
        })
        .collect()
}
