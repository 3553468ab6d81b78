use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::Config;
use super::engine::run_simulation_with_income;
use super::error::SolverError;
use super::matrix::{pension_only_strategies, strategy_matrix};
use super::types::{DrawdownOrder, SimulationParams, SimulationResult};

/// Multiple of the naive "spend it all evenly" income used as the default upper bound.
const UPPER_BOUND_MULTIPLE: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DepletionSolveConfig {
    /// Age of the simulation reference person at which the pots may run dry.
    /// Defaults to `income.target_depletion_age`, then to the simulation end age.
    pub target_age: Option<u32>,
    pub search_min: f64,
    /// Monthly income upper bound; derived from assets and horizon when unset.
    pub search_max: Option<f64>,
    /// Bracket width, in pounds per month, at which the search stops.
    pub tolerance: f64,
    pub max_iterations: u32,
    /// Run the pensions dry by the target age while leaving the ISAs untouched.
    pub pension_only: bool,
}

impl Default for DepletionSolveConfig {
    fn default() -> Self {
        Self {
            target_age: None,
            search_min: 0.0,
            search_max: None,
            tolerance: 1.0,
            max_iterations: 100,
            pension_only: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolveStatus {
    Converged,
    /// Iteration cap hit before the bracket narrowed to the tolerance.
    IterationCap,
    /// Even the lowest income runs out before the target year.
    TargetUnreachable,
    /// Even the highest income lasts until the target year.
    UpperBoundSustainable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepletionSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_monthly: f64,
    pub depletion_year: Option<i32>,
    pub sustainable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepletionSolveResult {
    pub params: SimulationParams,
    pub target_age: u32,
    pub target_year: i32,
    pub status: SolveStatus,
    /// Sustainable monthly income per ratio unit.
    pub solved_monthly: Option<f64>,
    /// `solved_monthly` scaled by each income tier's ratio, in tier order.
    pub monthly_by_tier: Vec<f64>,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub iterations: Vec<DepletionSolveIteration>,
    /// Simulation at the solved income, or at the lower bound when unreachable.
    pub result: SimulationResult,
}

impl DepletionSolveResult {
    pub fn is_solved(&self) -> bool {
        self.solved_monthly.is_some()
    }
}

/// One oracle call: a candidate income and when it runs out.
#[derive(Debug, Clone)]
struct Probe {
    monthly: f64,
    depletion_year: Option<i32>,
    result: SimulationResult,
}

impl Probe {
    fn run(config: &Config, params: &SimulationParams, monthly: f64, pension_only: bool) -> Self {
        let result = run_simulation_with_income(config, params, monthly);
        let depletion_year = if pension_only {
            result.pension_depletion_year()
        } else {
            result.depletion_year()
        };
        Self {
            monthly,
            depletion_year,
            result,
        }
    }

    fn sustainable(&self, target_year: i32) -> bool {
        self.depletion_year.is_none_or(|year| year >= target_year)
    }
}

/// Later depletion ranks higher; never depleting ranks highest.
fn depletion_rank(year: Option<i32>) -> i32 {
    year.unwrap_or(i32::MAX)
}

/// A higher income must never last longer than a lower one.
fn check_monotonic(lower: &Probe, higher: &Probe) -> Result<(), SolverError> {
    if depletion_rank(higher.depletion_year) > depletion_rank(lower.depletion_year) {
        return Err(SolverError::NonMonotonic {
            lower_income: lower.monthly,
            lower_depletion: lower.depletion_year,
            higher_income: higher.monthly,
            higher_depletion: higher.depletion_year,
        });
    }
    Ok(())
}

fn target_age(config: &Config, solve_config: &DepletionSolveConfig) -> u32 {
    solve_config
        .target_age
        .or(config.income.target_depletion_age)
        .unwrap_or(config.simulation.end_age)
}

/// Four times the monthly income that would spend assets plus guaranteed income evenly to the target.
/// Pension-only solves count the pensions alone.
fn default_upper_bound(config: &Config, target_year: i32, pension_only: bool) -> f64 {
    let years = (target_year - config.simulation.start_year).max(1) as f64;
    let guaranteed: f64 = config
        .people
        .iter()
        .map(|person| {
            config.financial.state_pension_amount
                + person.db_pension.as_ref().map_or(0.0, |db| db.annual_amount)
                + person.work_income
        })
        .sum();
    let assets = if pension_only {
        config.people.iter().map(|person| person.pension).sum()
    } else {
        config.initial_portfolio()
    };
    let annual = assets / years + guaranteed;
    (annual / 12.0 * UPPER_BOUND_MULTIPLE).max(1_000.0)
}

fn validate_config(
    config: &Config,
    solve_config: &DepletionSolveConfig,
    target_year: i32,
    search_max: f64,
) -> Result<(), SolverError> {
    if target_year <= config.simulation.start_year {
        return Err(SolverError::InvalidConfig(
            "target age must fall after the simulation start year".to_string(),
        ));
    }
    if !solve_config.search_min.is_finite() || !search_max.is_finite() {
        return Err(SolverError::InvalidConfig(
            "search bounds must be finite".to_string(),
        ));
    }
    if solve_config.search_min < 0.0 {
        return Err(SolverError::InvalidConfig(
            "search_min must be >= 0".to_string(),
        ));
    }
    if search_max <= solve_config.search_min {
        return Err(SolverError::InvalidConfig(
            "search_max must be greater than search_min".to_string(),
        ));
    }
    if !solve_config.tolerance.is_finite() || solve_config.tolerance <= 0.0 {
        return Err(SolverError::InvalidConfig(
            "tolerance must be > 0".to_string(),
        ));
    }
    if solve_config.max_iterations == 0 {
        return Err(SolverError::InvalidConfig(
            "max_iterations must be > 0".to_string(),
        ));
    }
    Ok(())
}

/// Pension-only solves always draw with [`DrawdownOrder::PensionOnly`].
fn oracle_params(params: &SimulationParams, solve_config: &DepletionSolveConfig) -> SimulationParams {
    if solve_config.pension_only {
        SimulationParams {
            drawdown_order: DrawdownOrder::PensionOnly,
            ..params.clone()
        }
    } else {
        params.clone()
    }
}

/// Strategies a multi-strategy solve should try for `config`.
pub fn depletion_strategies(config: &Config, solve_config: &DepletionSolveConfig) -> Vec<SimulationParams> {
    if solve_config.pension_only {
        pension_only_strategies(config)
    } else {
        strategy_matrix(config)
    }
}

/// Finds the highest monthly income that lasts until the target age under `params`.
///
/// With `pension_only` set, "lasts" means the pensions alone fund every year up to the target
/// and the ISAs are never drawn on.
pub fn solve_depletion(
    config: &Config,
    params: &SimulationParams,
    solve_config: &DepletionSolveConfig,
) -> Result<DepletionSolveResult, SolverError> {
    let params = &oracle_params(params, solve_config);
    let pension_only = solve_config.pension_only;
    let target_age = target_age(config, solve_config);
    let target_year = config.simulation_reference().birth_year() + target_age as i32;
    let search_max = solve_config
        .search_max
        .unwrap_or_else(|| default_upper_bound(config, target_year, pension_only));
    validate_config(config, solve_config, target_year, search_max)?;

    let mut iterations = Vec::with_capacity(solve_config.max_iterations as usize);
    let mut lo = Probe::run(config, params, solve_config.search_min, pension_only);
    let mut hi = Probe::run(config, params, search_max, pension_only);
    check_monotonic(&lo, &hi)?;

    let status;
    let solved;
    if !lo.sustainable(target_year) {
        warn!(
            strategy = %params,
            target_year,
            depletion_year = ?lo.depletion_year,
            "depletion target unreachable even at the lowest income"
        );
        status = SolveStatus::TargetUnreachable;
        solved = None;
    } else if hi.sustainable(target_year) {
        status = SolveStatus::UpperBoundSustainable;
        solved = Some(search_max);
        lo = hi.clone();
    } else {
        let mut it = 0;
        while it < solve_config.max_iterations && hi.monthly - lo.monthly > solve_config.tolerance {
            it += 1;
            let mid = Probe::run(config, params, (lo.monthly + hi.monthly) * 0.5, pension_only);
            check_monotonic(&lo, &mid)?;
            check_monotonic(&mid, &hi)?;

            let sustainable = mid.sustainable(target_year);
            iterations.push(DepletionSolveIteration {
                iteration: it,
                lower_bound: lo.monthly,
                upper_bound: hi.monthly,
                candidate_monthly: mid.monthly,
                depletion_year: mid.depletion_year,
                sustainable,
            });
            if sustainable {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        if hi.monthly - lo.monthly <= solve_config.tolerance {
            status = SolveStatus::Converged;
        } else {
            warn!(
                strategy = %params,
                iterations = it,
                lower = lo.monthly,
                upper = hi.monthly,
                "depletion search hit its iteration cap"
            );
            status = SolveStatus::IterationCap;
        }
        solved = Some(lo.monthly);
    }

    info!(
        strategy = %params,
        target_year,
        status = ?status,
        monthly = ?solved,
        "depletion solve finished"
    );

    let monthly_by_tier = solved
        .map(|monthly| {
            config
                .income
                .tiers
                .iter()
                .map(|tier| monthly * tier.ratio.unwrap_or(1.0))
                .collect()
        })
        .unwrap_or_default();

    Ok(DepletionSolveResult {
        params: params.clone(),
        target_age,
        target_year,
        status,
        solved_monthly: solved,
        monthly_by_tier,
        lower_bound: lo.monthly,
        upper_bound: hi.monthly,
        iterations,
        result: lo.result,
    })
}

/// Solves every strategy independently; results keep the order of `params_list`.
pub fn solve_all(
    config: &Config,
    params_list: &[SimulationParams],
    solve_config: &DepletionSolveConfig,
) -> Vec<Result<DepletionSolveResult, SolverError>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        params_list
            .par_iter()
            .map(|params| solve_depletion(config, params, solve_config))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        params_list
            .iter()
            .map(|params| solve_depletion(config, params, solve_config))
            .collect()
    }
}

/// Highest solved income, ties broken by lowest lifetime tax.
pub fn best_depletion(results: &[DepletionSolveResult]) -> Option<&DepletionSolveResult> {
    results
        .iter()
        .filter(|r| matches!(r.status, SolveStatus::Converged | SolveStatus::IterationCap))
        .filter_map(|r| r.solved_monthly.map(|monthly| (r, monthly)))
        .max_by(|(a, a_monthly), (b, b_monthly)| {
            a_monthly
                .total_cmp(b_monthly)
                .then_with(|| b.result.total_tax_paid.total_cmp(&a.result.total_tax_paid))
        })
        .map(|(r, _)| r)
}
