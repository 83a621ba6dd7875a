//! Collective scheduling optimization for the community.
//!
//! One mixed-integer program covers every meter of the horizon: retail
//! purchases and sales, market trades, and BESS operation. The pool variant
//! couples the meters through a per-interval market equilibrium whose shadow
//! prices are recovered after the fact; the bilateral variant trades through
//! explicit provider/receiver pairs.
//!
//! Solved with HiGHS through `good_lp`.

use good_lp::solvers::highs::highs;
use good_lp::{
    Constraint, Expression, ProblemVariables, Solution, SolverModel, Variable, constraint,
    variable, variables,
};
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Equilibrium perturbation used to recover shadow prices, in kWh.
const SHADOW_PRICE_DELTA: f64 = 1e-3;

/// Outcome reported by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MilpStatus {
    Optimal,
    Infeasible,
    Unbounded,
}

/// Behind-the-meter storage parameters.
#[derive(Debug, Clone, Copy)]
pub struct StorageSpec {
    /// Energy capacity, in kWh.
    pub capacity_kwh: f64,
    /// Maximum charge and discharge power, in kW.
    pub p_max_kw: f64,
    /// Minimum state of charge, in percent of capacity.
    pub soc_min_pct: f64,
    /// Maximum state of charge, in percent of capacity.
    pub soc_max_pct: f64,
    /// Charging efficiency, in percent.
    pub eff_charge_pct: f64,
    /// Discharging efficiency, in percent.
    pub eff_discharge_pct: f64,
    /// Degradation cost applied to discharged energy, in EUR/kWh.
    pub degradation_cost: f64,
}

/// One meter of the collective problem. All series span the horizon.
#[derive(Debug, Clone)]
pub struct MeterSpec {
    pub meter_id: String,
    /// Consumption per interval, in kWh.
    pub e_c: Vec<f64>,
    /// Generation per interval, in kWh.
    pub e_g: Vec<f64>,
    /// Retail buy tariff per interval, in EUR/kWh.
    pub buy_tariff: Vec<f64>,
    /// Retail sell tariff per interval, in EUR/kWh.
    pub sell_tariff: Vec<f64>,
    /// Contracted power at the meter, in kW.
    pub max_power_kw: f64,
    pub storage: Option<StorageSpec>,
}

impl MeterSpec {
    /// Maximum energy through the meter in one interval, in kWh.
    fn cap_kwh(&self, dt_hours: f64) -> f64 {
        self.max_power_kw * dt_hours
    }
}

/// Inputs of one collective solve.
#[derive(Debug, Clone)]
pub struct CollectiveProblem {
    /// Interval duration in hours.
    pub dt_hours: f64,
    pub meters: Vec<MeterSpec>,
    /// Self-consumption grid tariff per interval, applied to market
    /// purchases, in EUR/kWh.
    pub grid_tariffs: Vec<f64>,
}

impl CollectiveProblem {
    pub fn steps(&self) -> usize {
        self.grid_tariffs.len()
    }
}

/// Solved operation of one meter.
#[derive(Debug, Clone)]
pub struct MeterSchedule {
    pub meter_id: String,
    /// Energy bought from the retailer, in kWh.
    pub supplied: Vec<f64>,
    /// Energy sold to the retailer, in kWh.
    pub surplus: Vec<f64>,
    /// Net load at the meter after BESS operation, in kWh.
    pub net_load: Vec<f64>,
    /// BESS energy charged, in kWh.
    pub charged: Vec<f64>,
    /// BESS energy discharged, in kWh.
    pub discharged: Vec<f64>,
    /// BESS energy content at the end of each interval, in kWh.
    pub content: Vec<f64>,
    /// Energy purchased in the market, in kWh.
    pub purchased: Vec<f64>,
    /// Energy sold in the market, in kWh.
    pub sold: Vec<f64>,
}

impl MeterSchedule {
    fn zeroed(meter: &MeterSpec, steps: usize) -> Self {
        Self {
            meter_id: meter.meter_id.clone(),
            supplied: vec![0.0; steps],
            surplus: vec![0.0; steps],
            net_load: (0..steps).map(|t| meter.e_c[t] - meter.e_g[t]).collect(),
            charged: vec![0.0; steps],
            discharged: vec![0.0; steps],
            content: vec![0.0; steps],
            purchased: vec![0.0; steps],
            sold: vec![0.0; steps],
        }
    }
}

/// Energy delivered from one provider to one receiver over the horizon.
#[derive(Debug, Clone)]
pub struct PairTrade {
    pub provider: String,
    pub receiver: String,
    pub energy: Vec<f64>,
}

/// Result of a collective solve.
#[derive(Debug, Clone)]
pub struct CollectiveSolution {
    pub status: MilpStatus,
    pub objective_value: f64,
    pub meters: Vec<MeterSchedule>,
    /// Pairwise transactions; empty under pool organization.
    pub pair_trades: Vec<PairTrade>,
}

impl CollectiveSolution {
    fn degenerate(problem: &CollectiveProblem, status: MilpStatus) -> Self {
        let steps = problem.steps();
        Self {
            status,
            objective_value: 0.0,
            meters: problem
                .meters
                .iter()
                .map(|m| MeterSchedule::zeroed(m, steps))
                .collect(),
            pair_trades: Vec::new(),
        }
    }
}

struct StorageVars {
    charge: Vec<Variable>,
    discharge: Vec<Variable>,
    content: Vec<Variable>,
    mode: Vec<Variable>,
}

struct MeterVars {
    supplied: Vec<Variable>,
    surplus: Vec<Variable>,
    storage: Option<StorageVars>,
}

fn add_meter_vars(vars: &mut ProblemVariables, meter: &MeterSpec, steps: usize, dt: f64) -> MeterVars {
    let cap = meter.cap_kwh(dt);
    let supplied = (0..steps)
        .map(|_| vars.add(variable().min(0.0).max(cap)))
        .collect();
    let surplus = (0..steps)
        .map(|_| vars.add(variable().min(0.0).max(cap)))
        .collect();
    let storage = meter.storage.as_ref().map(|st| {
        let p_cap = st.p_max_kw * dt;
        let e_min = st.capacity_kwh * st.soc_min_pct / 100.0;
        let e_max = st.capacity_kwh * st.soc_max_pct / 100.0;
        StorageVars {
            charge: (0..steps)
                .map(|_| vars.add(variable().min(0.0).max(p_cap)))
                .collect(),
            discharge: (0..steps)
                .map(|_| vars.add(variable().min(0.0).max(p_cap)))
                .collect(),
            content: (0..steps)
                .map(|_| vars.add(variable().min(e_min).max(e_max)))
                .collect(),
            mode: (0..steps)
                .map(|_| vars.add(variable().integer().min(0.0).max(1.0)))
                .collect(),
        }
    });
    MeterVars {
        supplied,
        surplus,
        storage,
    }
}

/// BESS dynamics: content tracking from a zero initial charge, and a binary
/// mode forbidding simultaneous charge and discharge.
fn storage_constraints(sv: &StorageVars, st: &StorageSpec, steps: usize, dt: f64) -> Vec<Constraint> {
    let eff_c = st.eff_charge_pct / 100.0;
    let eff_d = st.eff_discharge_pct / 100.0;
    let p_cap = st.p_max_kw * dt;
    let mut out = Vec::with_capacity(steps * 3);
    for t in 0..steps {
        let inflow: Expression = eff_c * sv.charge[t] + (-1.0 / eff_d) * sv.discharge[t];
        let tracking: Expression = if t == 0 {
            1.0 * sv.content[0] - inflow
        } else {
            1.0 * sv.content[t] + (-1.0) * sv.content[t - 1] - inflow
        };
        out.push(constraint!(tracking == 0.0));
        let charge_gate: Expression = 1.0 * sv.charge[t] + (-p_cap) * sv.mode[t];
        out.push(constraint!(charge_gate <= 0.0));
        let discharge_gate: Expression = 1.0 * sv.discharge[t] + p_cap * sv.mode[t];
        out.push(constraint!(discharge_gate <= p_cap));
    }
    out
}

/// Energy balance at one meter for one interval, without the trade terms.
fn balance_base(mv: &MeterVars, t: usize) -> Expression {
    let mut lhs: Expression = 1.0 * mv.supplied[t] + (-1.0) * mv.surplus[t];
    if let Some(sv) = &mv.storage {
        lhs += (-1.0) * sv.charge[t];
        lhs += 1.0 * sv.discharge[t];
    }
    lhs
}

fn retail_cost_terms(meter: &MeterSpec, mv: &MeterVars, steps: usize) -> Vec<Expression> {
    let mut terms = Vec::new();
    for t in 0..steps {
        terms.push(meter.buy_tariff[t] * mv.supplied[t]);
        terms.push(-meter.sell_tariff[t] * mv.surplus[t]);
        if let (Some(sv), Some(st)) = (&mv.storage, &meter.storage) {
            if st.degradation_cost != 0.0 {
                terms.push(st.degradation_cost * sv.discharge[t]);
            }
        }
    }
    terms
}

fn extract_meter_schedule(
    sol: &impl Solution,
    meter: &MeterSpec,
    mv: &MeterVars,
    steps: usize,
) -> MeterSchedule {
    let value = |v: Variable| sol.value(v).max(0.0);
    let charged: Vec<f64> = (0..steps)
        .map(|t| mv.storage.as_ref().map_or(0.0, |sv| value(sv.charge[t])))
        .collect();
    let discharged: Vec<f64> = (0..steps)
        .map(|t| mv.storage.as_ref().map_or(0.0, |sv| value(sv.discharge[t])))
        .collect();
    MeterSchedule {
        meter_id: meter.meter_id.clone(),
        supplied: (0..steps).map(|t| value(mv.supplied[t])).collect(),
        surplus: (0..steps).map(|t| value(mv.surplus[t])).collect(),
        net_load: (0..steps)
            .map(|t| meter.e_c[t] - meter.e_g[t] + charged[t] - discharged[t])
            .collect(),
        content: (0..steps)
            .map(|t| mv.storage.as_ref().map_or(0.0, |sv| value(sv.content[t])))
            .collect(),
        charged,
        discharged,
        purchased: vec![0.0; steps],
        sold: vec![0.0; steps],
    }
}

/// Solves the pool-organized collective problem.
pub fn solve_pool(problem: &CollectiveProblem) -> Result<CollectiveSolution> {
    let steps = problem.steps();
    if steps == 0 || problem.meters.is_empty() {
        return Ok(CollectiveSolution::degenerate(problem, MilpStatus::Optimal));
    }
    let dt = problem.dt_hours;

    let mut vars = variables!();
    let meter_vars: Vec<MeterVars> = problem
        .meters
        .iter()
        .map(|m| add_meter_vars(&mut vars, m, steps, dt))
        .collect();
    // Pool trade variables per meter, bounded by the meter connection.
    let purchases: Vec<Vec<Variable>> = problem
        .meters
        .iter()
        .map(|m| {
            let cap = m.cap_kwh(dt);
            (0..steps)
                .map(|_| vars.add(variable().min(0.0).max(cap)))
                .collect()
        })
        .collect();
    let sales: Vec<Vec<Variable>> = problem
        .meters
        .iter()
        .map(|m| {
            let cap = m.cap_kwh(dt);
            (0..steps)
                .map(|_| vars.add(variable().min(0.0).max(cap)))
                .collect()
        })
        .collect();

    let mut terms: Vec<Expression> = Vec::new();
    for (i, meter) in problem.meters.iter().enumerate() {
        terms.extend(retail_cost_terms(meter, &meter_vars[i], steps));
        for t in 0..steps {
            terms.push(problem.grid_tariffs[t] * purchases[i][t]);
        }
    }
    let objective: Expression = terms.into_iter().sum();

    let mut model = vars.minimise(objective).using(highs);

    for (i, meter) in problem.meters.iter().enumerate() {
        for t in 0..steps {
            let net = meter.e_c[t] - meter.e_g[t];
            let lhs =
                balance_base(&meter_vars[i], t) + 1.0 * purchases[i][t] + (-1.0) * sales[i][t];
            model = model.with(constraint!(lhs == net));
        }
        if let (Some(sv), Some(st)) = (&meter_vars[i].storage, &meter.storage) {
            for c in storage_constraints(sv, st, steps, dt) {
                model = model.with(c);
            }
        }
    }
    for t in 0..steps {
        let balance: Expression = (0..problem.meters.len())
            .map(|i| 1.0 * purchases[i][t] + (-1.0) * sales[i][t])
            .sum();
        model = model.with(constraint!(balance == 0.0));
    }

    let sol = match model.solve() {
        Ok(sol) => sol,
        Err(good_lp::ResolutionError::Infeasible) => {
            return Ok(CollectiveSolution::degenerate(problem, MilpStatus::Infeasible));
        }
        Err(good_lp::ResolutionError::Unbounded) => {
            return Ok(CollectiveSolution::degenerate(problem, MilpStatus::Unbounded));
        }
        Err(e) => {
            return Err(Error::Solver {
                message: e.to_string(),
            });
        }
    };

    let mut meters = Vec::with_capacity(problem.meters.len());
    let mut objective_value = 0.0;
    for (i, meter) in problem.meters.iter().enumerate() {
        let mut schedule = extract_meter_schedule(&sol, meter, &meter_vars[i], steps);
        for t in 0..steps {
            schedule.purchased[t] = sol.value(purchases[i][t]).max(0.0);
            schedule.sold[t] = sol.value(sales[i][t]).max(0.0);
        }
        for t in 0..steps {
            objective_value += meter.buy_tariff[t] * schedule.supplied[t]
                - meter.sell_tariff[t] * schedule.surplus[t]
                + problem.grid_tariffs[t] * schedule.purchased[t];
            if let Some(st) = &meter.storage {
                objective_value += st.degradation_cost * schedule.discharged[t];
            }
        }
        meters.push(schedule);
    }

    Ok(CollectiveSolution {
        status: MilpStatus::Optimal,
        objective_value,
        meters,
        pair_trades: Vec::new(),
    })
}

/// Solves the bilateral-organized collective problem.
pub fn solve_bilateral(problem: &CollectiveProblem) -> Result<CollectiveSolution> {
    let steps = problem.steps();
    if steps == 0 || problem.meters.len() < 2 {
        return Ok(CollectiveSolution::degenerate(problem, MilpStatus::Optimal));
    }
    let dt = problem.dt_hours;
    let n = problem.meters.len();

    let mut vars = variables!();
    let meter_vars: Vec<MeterVars> = problem
        .meters
        .iter()
        .map(|m| add_meter_vars(&mut vars, m, steps, dt))
        .collect();

    // One trade series per ordered (receiver, provider) pair.
    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|r| (0..n).filter(move |p| *p != r).map(move |p| (r, p)))
        .collect();
    let trades: Vec<Vec<Variable>> = pairs
        .iter()
        .map(|(r, _)| {
            let cap = problem.meters[*r].cap_kwh(dt);
            (0..steps)
                .map(|_| vars.add(variable().min(0.0).max(cap)))
                .collect()
        })
        .collect();

    let mut terms: Vec<Expression> = Vec::new();
    for (i, meter) in problem.meters.iter().enumerate() {
        terms.extend(retail_cost_terms(meter, &meter_vars[i], steps));
    }
    for (k, _) in pairs.iter().enumerate() {
        for t in 0..steps {
            terms.push(problem.grid_tariffs[t] * trades[k][t]);
        }
    }
    let objective: Expression = terms.into_iter().sum();

    let mut model = vars.minimise(objective).using(highs);

    for (i, meter) in problem.meters.iter().enumerate() {
        for t in 0..steps {
            let net = meter.e_c[t] - meter.e_g[t];
            let mut lhs = balance_base(&meter_vars[i], t);
            for (k, (r, p)) in pairs.iter().enumerate() {
                if *r == i {
                    lhs += 1.0 * trades[k][t];
                } else if *p == i {
                    lhs += (-1.0) * trades[k][t];
                }
            }
            model = model.with(constraint!(lhs == net));
        }
        if let (Some(sv), Some(st)) = (&meter_vars[i].storage, &meter.storage) {
            for c in storage_constraints(sv, st, steps, dt) {
                model = model.with(c);
            }
        }
    }

    let sol = match model.solve() {
        Ok(sol) => sol,
        Err(good_lp::ResolutionError::Infeasible) => {
            return Ok(CollectiveSolution::degenerate(problem, MilpStatus::Infeasible));
        }
        Err(good_lp::ResolutionError::Unbounded) => {
            return Ok(CollectiveSolution::degenerate(problem, MilpStatus::Unbounded));
        }
        Err(e) => {
            return Err(Error::Solver {
                message: e.to_string(),
            });
        }
    };

    let mut meters: Vec<MeterSchedule> = problem
        .meters
        .iter()
        .enumerate()
        .map(|(i, m)| extract_meter_schedule(&sol, m, &meter_vars[i], steps))
        .collect();
    let mut pair_trades = Vec::with_capacity(pairs.len());
    for (k, (r, p)) in pairs.iter().enumerate() {
        let energy: Vec<f64> = (0..steps).map(|t| sol.value(trades[k][t]).max(0.0)).collect();
        for t in 0..steps {
            meters[*r].purchased[t] += energy[t];
            meters[*p].sold[t] += energy[t];
        }
        pair_trades.push(PairTrade {
            provider: problem.meters[*p].meter_id.clone(),
            receiver: problem.meters[*r].meter_id.clone(),
            energy,
        });
    }

    let mut objective_value = 0.0;
    for (i, meter) in problem.meters.iter().enumerate() {
        for t in 0..steps {
            objective_value += meter.buy_tariff[t] * meters[i].supplied[t]
                - meter.sell_tariff[t] * meters[i].surplus[t];
            if let Some(st) = &meter.storage {
                objective_value += st.degradation_cost * meters[i].discharged[t];
            }
        }
    }
    for trade in &pair_trades {
        for t in 0..steps {
            objective_value += problem.grid_tariffs[t] * trade.energy[t];
        }
    }

    Ok(CollectiveSolution {
        status: MilpStatus::Optimal,
        objective_value,
        meters,
        pair_trades,
    })
}

/// Solves a single meter against fixed market prices. Used by the iterative
/// algorithm to formulate offers. An infeasible meter falls back to its raw
/// net load with the BESS idle.
pub fn solve_individual(
    meter: &MeterSpec,
    dt: f64,
    grid_tariffs: &[f64],
    prices: &[f64],
) -> Result<MeterSchedule> {
    let steps = grid_tariffs.len();
    let mut vars = variables!();
    let mv = add_meter_vars(&mut vars, meter, steps, dt);
    let cap = meter.cap_kwh(dt);
    let purchases: Vec<Variable> = (0..steps)
        .map(|_| vars.add(variable().min(0.0).max(cap)))
        .collect();
    let sales: Vec<Variable> = (0..steps)
        .map(|_| vars.add(variable().min(0.0).max(cap)))
        .collect();

    let mut terms: Vec<Expression> = retail_cost_terms(meter, &mv, steps);
    for t in 0..steps {
        terms.push((prices[t] + grid_tariffs[t]) * purchases[t]);
        terms.push(-prices[t] * sales[t]);
    }
    let objective: Expression = terms.into_iter().sum();

    let mut model = vars.minimise(objective).using(highs);
    for t in 0..steps {
        let net = meter.e_c[t] - meter.e_g[t];
        let lhs = balance_base(&mv, t) + 1.0 * purchases[t] + (-1.0) * sales[t];
        model = model.with(constraint!(lhs == net));
    }
    if let (Some(sv), Some(st)) = (&mv.storage, &meter.storage) {
        for c in storage_constraints(sv, st, steps, dt) {
            model = model.with(c);
        }
    }

    match model.solve() {
        Ok(sol) => {
            let mut schedule = extract_meter_schedule(&sol, meter, &mv, steps);
            for t in 0..steps {
                schedule.purchased[t] = sol.value(purchases[t]).max(0.0);
                schedule.sold[t] = sol.value(sales[t]).max(0.0);
            }
            Ok(schedule)
        }
        Err(good_lp::ResolutionError::Infeasible) => {
            warn!(meter_id = %meter.meter_id, "individual problem infeasible, using raw net load");
            Ok(MeterSchedule::zeroed(meter, steps))
        }
        Err(e) => Err(Error::Solver {
            message: e.to_string(),
        }),
    }
}

/// Recovers the pool equilibrium shadow prices of a solved problem.
///
/// The BESS operation is frozen at the solved schedule and, interval by
/// interval, the equilibrium is perturbed to require a small net export from
/// the community; the price is the objective increase per unit of
/// perturbation. Non-optimal solutions get a zero price vector.
pub fn pool_shadow_prices(
    problem: &CollectiveProblem,
    solution: &CollectiveSolution,
) -> Result<Vec<f64>> {
    let steps = problem.steps();
    if solution.status != MilpStatus::Optimal {
        return Ok(vec![0.0; steps]);
    }
    let base = match solve_pool_fixed(problem, solution, None)? {
        Some(objective) => objective,
        None => {
            warn!("fixed-storage pricing problem infeasible");
            return Ok(vec![0.0; steps]);
        }
    };
    let mut prices = Vec::with_capacity(steps);
    for t in 0..steps {
        match solve_pool_fixed(problem, solution, Some(t))? {
            Some(objective) => prices.push((objective - base) / SHADOW_PRICE_DELTA),
            None => {
                warn!(interval = t, "perturbed pricing problem infeasible");
                prices.push(0.0);
            }
        }
    }
    Ok(prices)
}

/// Linear pricing problem with the BESS schedule fixed. Returns the optimal
/// objective, or `None` when infeasible.
fn solve_pool_fixed(
    problem: &CollectiveProblem,
    solution: &CollectiveSolution,
    perturb: Option<usize>,
) -> Result<Option<f64>> {
    let steps = problem.steps();
    let dt = problem.dt_hours;
    let n = problem.meters.len();

    let mut vars = variables!();
    let mut supplied = Vec::with_capacity(n);
    let mut surplus = Vec::with_capacity(n);
    let mut purchases = Vec::with_capacity(n);
    let mut sales = Vec::with_capacity(n);
    for meter in &problem.meters {
        let cap = meter.cap_kwh(dt);
        let mk = |vars: &mut ProblemVariables| -> Vec<Variable> {
            (0..steps)
                .map(|_| vars.add(variable().min(0.0).max(cap)))
                .collect()
        };
        supplied.push(mk(&mut vars));
        surplus.push(mk(&mut vars));
        purchases.push(mk(&mut vars));
        sales.push(mk(&mut vars));
    }

    let mut terms: Vec<Expression> = Vec::new();
    for (i, meter) in problem.meters.iter().enumerate() {
        for t in 0..steps {
            terms.push(meter.buy_tariff[t] * supplied[i][t]);
            terms.push(-meter.sell_tariff[t] * surplus[i][t]);
            terms.push(problem.grid_tariffs[t] * purchases[i][t]);
        }
    }
    let objective: Expression = terms.into_iter().sum();

    let mut model = vars.minimise(objective).using(highs);
    for (i, meter) in problem.meters.iter().enumerate() {
        let schedule = &solution.meters[i];
        for t in 0..steps {
            // Fixed BESS flows move into the right-hand side.
            let net = meter.e_c[t] - meter.e_g[t] + schedule.charged[t] - schedule.discharged[t];
            let lhs: Expression = 1.0 * supplied[i][t] + (-1.0) * surplus[i][t]
                + 1.0 * purchases[i][t]
                + (-1.0) * sales[i][t];
            model = model.with(constraint!(lhs == net));
        }
    }
    for t in 0..steps {
        let balance: Expression = (0..n)
            .map(|i| 1.0 * purchases[i][t] + (-1.0) * sales[i][t])
            .sum();
        let rhs = if perturb == Some(t) { -SHADOW_PRICE_DELTA } else { 0.0 };
        model = model.with(constraint!(balance == rhs));
    }

    match model.solve() {
        Ok(sol) => {
            let mut objective_value = 0.0;
            for (i, meter) in problem.meters.iter().enumerate() {
                for t in 0..steps {
                    objective_value += meter.buy_tariff[t] * sol.value(supplied[i][t])
                        - meter.sell_tariff[t] * sol.value(surplus[i][t])
                        + problem.grid_tariffs[t] * sol.value(purchases[i][t]);
                }
            }
            Ok(Some(objective_value))
        }
        Err(good_lp::ResolutionError::Infeasible) => Ok(None),
        Err(e) => Err(Error::Solver {
            message: e.to_string(),
        }),
    }
}

/// Per-meter operation cost over the horizon, excluding BESS degradation:
/// retail purchases minus retail sales, plus market purchases and sales
/// settled at `prices`, plus the self-consumption tariff on market
/// purchases.
pub fn individual_costs(
    problem: &CollectiveProblem,
    solution: &CollectiveSolution,
    prices: &[f64],
) -> Vec<(String, f64)> {
    problem
        .meters
        .iter()
        .zip(&solution.meters)
        .map(|(meter, schedule)| {
            let mut cost = 0.0;
            for t in 0..problem.steps() {
                cost += meter.buy_tariff[t] * schedule.supplied[t]
                    - meter.sell_tariff[t] * schedule.surplus[t]
                    + prices[t] * (schedule.purchased[t] - schedule.sold[t])
                    + problem.grid_tariffs[t] * schedule.purchased[t];
            }
            (meter.meter_id.clone(), cost)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(id: &str, e_c: Vec<f64>, e_g: Vec<f64>) -> MeterSpec {
        let steps = e_c.len();
        MeterSpec {
            meter_id: id.to_string(),
            e_c,
            e_g,
            buy_tariff: vec![0.16; steps],
            sell_tariff: vec![0.04; steps],
            max_power_kw: 41.4,
            storage: None,
        }
    }

    fn two_meter_problem() -> CollectiveProblem {
        CollectiveProblem {
            dt_hours: 0.25,
            meters: vec![
                meter("buyer", vec![1.0], vec![0.0]),
                meter("seller", vec![0.0], vec![1.0]),
            ],
            grid_tariffs: vec![0.02],
        }
    }

    #[test]
    fn pool_matches_buyer_with_seller() {
        let problem = two_meter_problem();
        let sol = solve_pool(&problem).unwrap();
        assert_eq!(sol.status, MilpStatus::Optimal);
        assert!((sol.meters[0].purchased[0] - 1.0).abs() < 1e-6);
        assert!((sol.meters[1].sold[0] - 1.0).abs() < 1e-6);
        // Internal trade at the grid tariff beats the retail spread.
        assert!((sol.objective_value - 0.02).abs() < 1e-6);
    }

    #[test]
    fn pool_equilibrium_holds_per_interval() {
        let problem = CollectiveProblem {
            dt_hours: 0.25,
            meters: vec![
                meter("a", vec![1.0, 0.5], vec![0.0, 0.0]),
                meter("b", vec![0.0, 0.0], vec![0.4, 1.0]),
                meter("c", vec![0.2, 0.2], vec![0.0, 0.0]),
            ],
            grid_tariffs: vec![0.02, 0.02],
        };
        let sol = solve_pool(&problem).unwrap();
        assert_eq!(sol.status, MilpStatus::Optimal);
        for t in 0..2 {
            let bought: f64 = sol.meters.iter().map(|m| m.purchased[t]).sum();
            let sold: f64 = sol.meters.iter().map(|m| m.sold[t]).sum();
            assert!((bought - sold).abs() < 1e-6, "interval {t}: {bought} != {sold}");
        }
    }

    #[test]
    fn storage_shifts_surplus_to_later_demand() {
        let mut m = meter("bess", vec![0.0, 2.0], vec![2.0, 0.0]);
        m.sell_tariff = vec![0.0, 0.0];
        m.storage = Some(StorageSpec {
            capacity_kwh: 5.0,
            p_max_kw: 8.0,
            soc_min_pct: 0.0,
            soc_max_pct: 100.0,
            eff_charge_pct: 100.0,
            eff_discharge_pct: 100.0,
            degradation_cost: 0.0,
        });
        let problem = CollectiveProblem {
            dt_hours: 0.25,
            meters: vec![m],
            grid_tariffs: vec![0.02, 0.02],
        };
        let sol = solve_pool(&problem).unwrap();
        assert_eq!(sol.status, MilpStatus::Optimal);
        assert!((sol.meters[0].charged[0] - 2.0).abs() < 1e-6);
        assert!((sol.meters[0].discharged[1] - 2.0).abs() < 1e-6);
        assert!(sol.objective_value.abs() < 1e-6);
    }

    #[test]
    fn storage_never_charges_and_discharges_together() {
        let mut m = meter("bess", vec![1.0, 1.0], vec![1.0, 1.0]);
        m.storage = Some(StorageSpec {
            capacity_kwh: 5.0,
            p_max_kw: 8.0,
            soc_min_pct: 0.0,
            soc_max_pct: 100.0,
            eff_charge_pct: 95.0,
            eff_discharge_pct: 95.0,
            degradation_cost: 0.01,
        });
        let problem = CollectiveProblem {
            dt_hours: 0.25,
            meters: vec![m, meter("other", vec![0.5, 0.5], vec![0.0, 0.0])],
            grid_tariffs: vec![0.02, 0.02],
        };
        let sol = solve_pool(&problem).unwrap();
        for t in 0..2 {
            let simultaneous =
                sol.meters[0].charged[t].min(sol.meters[0].discharged[t]);
            assert!(simultaneous < 1e-6);
        }
    }

    #[test]
    fn zero_contracted_power_is_infeasible() {
        let mut m = meter("stuck", vec![1.0], vec![0.0]);
        m.max_power_kw = 0.0;
        let problem = CollectiveProblem {
            dt_hours: 0.25,
            meters: vec![m, meter("other", vec![0.1], vec![0.0])],
            grid_tariffs: vec![0.02],
        };
        let sol = solve_pool(&problem).unwrap();
        assert_eq!(sol.status, MilpStatus::Infeasible);
        assert_eq!(sol.objective_value, 0.0);
        assert_eq!(sol.meters[0].supplied, vec![0.0]);
    }

    #[test]
    fn shadow_price_stays_within_tariff_band() {
        let problem = two_meter_problem();
        let sol = solve_pool(&problem).unwrap();
        let prices = pool_shadow_prices(&problem, &sol).unwrap();
        assert_eq!(prices.len(), 1);
        assert!(
            prices[0] >= 0.02 && prices[0] <= 0.17,
            "price out of band: {}",
            prices[0]
        );
    }

    #[test]
    fn bilateral_trade_matches_pool_total() {
        let problem = two_meter_problem();
        let pool = solve_pool(&problem).unwrap();
        let bilateral = solve_bilateral(&problem).unwrap();
        assert_eq!(bilateral.status, MilpStatus::Optimal);
        let pair = bilateral
            .pair_trades
            .iter()
            .find(|tr| tr.provider == "seller" && tr.receiver == "buyer")
            .unwrap();
        assert!((pair.energy[0] - pool.meters[0].purchased[0]).abs() < 1e-6);
        assert!((bilateral.objective_value - pool.objective_value).abs() < 1e-6);
    }

    #[test]
    fn individual_costs_sum_to_objective_without_storage() {
        let problem = two_meter_problem();
        let sol = solve_pool(&problem).unwrap();
        let prices = vec![0.08];
        let costs = individual_costs(&problem, &sol, &prices);
        let total: f64 = costs.iter().map(|(_, c)| c).sum();
        // Market settlements cancel at equilibrium.
        assert!((total - sol.objective_value).abs() < 1e-6);
    }

    #[test]
    fn individual_solve_prefers_market_over_retail_surplus() {
        let m = meter("solo", vec![0.0], vec![1.0]);
        let schedule = solve_individual(&m, 0.25, &[0.02], &[0.10]).unwrap();
        assert!((schedule.sold[0] - 1.0).abs() < 1e-6);
        assert!(schedule.surplus[0] < 1e-6);
    }

    #[test]
    fn individual_solve_ignores_market_when_priced_out() {
        let m = meter("solo", vec![0.0], vec![1.0]);
        // Market pays less than the retailer: surplus goes to the retailer.
        let schedule = solve_individual(&m, 0.25, &[0.02], &[0.01]).unwrap();
        assert!((schedule.surplus[0] - 1.0).abs() < 1e-6);
        assert!(schedule.sold[0] < 1e-6);
    }
}
