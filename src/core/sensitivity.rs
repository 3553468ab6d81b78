//! Growth-rate sensitivity: the strategy matrix, or the depletion solver, re-run over a grid of
//! pension and savings growth rates taken from [`SensitivityConfig`].

use serde::Serialize;
use tracing::info;

use super::config::{Config, SensitivityConfig};
use super::error::SolverError;
use super::matrix::{best_strategy, run_all, strategy_matrix};
use super::solver::{
    DepletionSolveConfig, SolveStatus, best_depletion, depletion_strategies, solve_all,
};
use super::types::{SimulationParams, SimulationResult};

/// A best run that falls short but still holds more than this had an income gap, not depletion.
const SHORTFALL_BALANCE: f64 = 1_000.0;

/// Inclusive rates from `min` to `max` in `step` increments; empty for a degenerate range.
pub fn growth_rates(min: f64, max: f64, step: f64) -> Vec<f64> {
    if !(step.is_finite() && min.is_finite() && max.is_finite()) || step <= 0.0 || max < min {
        return Vec::new();
    }
    let count = ((max - min) / step + 1e-6).floor() as usize + 1;
    (0..count)
        .map(|i| ((min + i as f64 * step) * 1e9).round() / 1e9)
        .collect()
}

/// Every (pension, savings) growth pair, pension rate outermost.
pub fn growth_grid(sens: &SensitivityConfig) -> Vec<(f64, f64)> {
    let savings = growth_rates(sens.savings_growth_min, sens.savings_growth_max, sens.step_size);
    growth_rates(sens.pension_growth_min, sens.pension_growth_max, sens.step_size)
        .into_iter()
        .flat_map(|pension| savings.iter().map(move |&saving| (pension, saving)))
        .collect()
}

fn with_growth(config: &Config, pension: f64, savings: f64) -> Config {
    let mut config = config.clone();
    config.financial.pension_growth_rate = pension;
    config.financial.savings_growth_rate = savings;
    config
}

fn map_grid<T, F>(grid: &[(f64, f64)], cell: F) -> Vec<T>
where
    T: Send,
    F: Fn(f64, f64) -> T + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        grid.par_iter()
            .map(|&(pension, savings)| cell(pension, savings))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        grid.iter()
            .map(|&(pension, savings)| cell(pension, savings))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOutcome {
    pub name: String,
    pub ran_out_year: Option<i32>,
    pub final_balance: f64,
    pub total_tax: f64,
}

impl From<&SimulationResult> for StrategyOutcome {
    fn from(result: &SimulationResult) -> Self {
        Self {
            name: result.name.clone(),
            ran_out_year: result.ran_out_year,
            final_balance: result.final_total(),
            total_tax: result.total_tax_paid,
        }
    }
}

/// The strategy matrix at one growth-rate pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivityCell {
    pub pension_growth: f64,
    pub savings_growth: f64,
    pub best_strategy: Option<String>,
    /// Year the best strategy ran out, if it did.
    pub lasts_until: Option<i32>,
    pub total_tax: f64,
    pub final_balance: f64,
    pub all_run_out: bool,
    /// Best strategy missed some income but still holds money.
    pub has_shortfall: bool,
    pub strategies: Vec<StrategyOutcome>,
}

fn matrix_cell(
    config: &Config,
    strategies: &[SimulationParams],
    pension: f64,
    savings: f64,
) -> SensitivityCell {
    let config = with_growth(config, pension, savings);
    let results = run_all(&config, strategies);
    let best = best_strategy(&results).map(StrategyOutcome::from);
    let final_balance = best.as_ref().map_or(0.0, |b| b.final_balance);
    SensitivityCell {
        pension_growth: pension,
        savings_growth: savings,
        best_strategy: best.as_ref().map(|b| b.name.clone()),
        lasts_until: best.as_ref().and_then(|b| b.ran_out_year),
        total_tax: best.as_ref().map_or(0.0, |b| b.total_tax),
        final_balance,
        all_run_out: results.iter().all(|r| r.ran_out_of_money),
        has_shortfall: best
            .as_ref()
            .is_some_and(|b| b.ran_out_year.is_some() && final_balance > SHORTFALL_BALANCE),
        strategies: results.iter().map(StrategyOutcome::from).collect(),
    }
}

/// Runs the full strategy matrix at every grid point. Cells follow [`growth_grid`] order.
pub fn run_sensitivity(config: &Config) -> Vec<SensitivityCell> {
    let grid = growth_grid(&config.sensitivity);
    let strategies = strategy_matrix(config);
    info!(
        cells = grid.len(),
        strategies = strategies.len(),
        "running growth sensitivity"
    );
    map_grid(&grid, |pension, savings| {
        matrix_cell(config, &strategies, pension, savings)
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepletionOutcome {
    pub name: String,
    pub status: Option<SolveStatus>,
    pub solved_monthly: Option<f64>,
    pub error: Option<String>,
}

/// The depletion solve at one growth-rate pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepletionSensitivityCell {
    pub pension_growth: f64,
    pub savings_growth: f64,
    pub best_strategy: Option<String>,
    pub best_monthly: Option<f64>,
    /// ISA savings left at the end of the best strategy's run.
    pub final_isa_balance: Option<f64>,
    pub strategies: Vec<DepletionOutcome>,
}

fn depletion_cell(
    config: &Config,
    strategies: &[SimulationParams],
    solve_config: &DepletionSolveConfig,
    pension: f64,
    savings: f64,
) -> Result<DepletionSensitivityCell, SolverError> {
    let config = with_growth(config, pension, savings);
    let mut solved = Vec::with_capacity(strategies.len());
    let mut outcomes = Vec::with_capacity(strategies.len());
    for (params, outcome) in strategies.iter().zip(solve_all(&config, strategies, solve_config)) {
        match outcome {
            Ok(result) => {
                outcomes.push(DepletionOutcome {
                    name: result.result.name.clone(),
                    status: Some(result.status),
                    solved_monthly: result.solved_monthly,
                    error: None,
                });
                solved.push(result);
            }
            Err(err @ SolverError::InvalidConfig(_)) => return Err(err),
            Err(err) => outcomes.push(DepletionOutcome {
                name: params.short_name(),
                status: None,
                solved_monthly: None,
                error: Some(err.to_string()),
            }),
        }
    }

    let best = best_depletion(&solved);
    Ok(DepletionSensitivityCell {
        pension_growth: pension,
        savings_growth: savings,
        best_strategy: best.map(|b| b.result.name.clone()),
        best_monthly: best.and_then(|b| b.solved_monthly),
        final_isa_balance: best.map(|b| {
            b.result
                .final_balances
                .values()
                .map(|balances| balances.tax_free_savings)
                .sum()
        }),
        strategies: outcomes,
    })
}

/// Solves every depletion strategy at every grid point. Invalid solver settings fail the whole
/// sweep; other per-strategy failures are reported in the cell.
pub fn run_depletion_sensitivity(
    config: &Config,
    solve_config: &DepletionSolveConfig,
) -> Result<Vec<DepletionSensitivityCell>, SolverError> {
    let grid = growth_grid(&config.sensitivity);
    let strategies = depletion_strategies(config, solve_config);
    info!(
        cells = grid.len(),
        strategies = strategies.len(),
        pension_only = solve_config.pension_only,
        "running depletion sensitivity"
    );
    map_grid(&grid, |pension, savings| {
        depletion_cell(config, &strategies, solve_config, pension, savings)
    })
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::fixtures::single_config;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn grid(pension: (f64, f64), savings: (f64, f64), step: f64) -> SensitivityConfig {
        SensitivityConfig {
            pension_growth_min: pension.0,
            pension_growth_max: pension.1,
            savings_growth_min: savings.0,
            savings_growth_max: savings.1,
            step_size: step,
        }
    }

    #[test]
    fn rates_include_both_ends() {
        assert_eq!(growth_rates(0.04, 0.06, 0.01), vec![0.04, 0.05, 0.06]);
        assert_eq!(growth_rates(0.05, 0.05, 0.01), vec![0.05]);
        assert_eq!(growth_rates(0.04, 0.065, 0.01).len(), 3);
        assert!(growth_rates(0.06, 0.04, 0.01).is_empty());
        assert!(growth_rates(0.04, 0.06, 0.0).is_empty());
        assert_eq!(growth_rates(0.04, 0.12, 0.01).len(), 9);
    }

    #[test]
    fn grid_is_pension_major() {
        let cells = growth_grid(&grid((0.03, 0.05), (0.0, 0.01), 0.01));
        assert_eq!(cells.len(), 3 * 2);
        assert_eq!(cells[0], (0.03, 0.0));
        assert_eq!(cells[1], (0.03, 0.01));
        assert_eq!(cells[5], (0.05, 0.01));
    }

    #[test]
    fn matrix_sensitivity_covers_the_grid() {
        let mut config = single_config();
        config.sensitivity = grid((0.02, 0.06), (0.02, 0.06), 0.04);
        let cells = run_sensitivity(&config);
        assert_eq!(cells.len(), 4);
        let strategies = strategy_matrix(&config).len();
        for cell in &cells {
            assert_eq!(cell.strategies.len(), strategies);
            assert!(cell.best_strategy.is_some());
            assert_eq!(cell.all_run_out, cell.strategies.iter().all(|s| s.ran_out_year.is_some()));
        }

        let low = &cells[0];
        let high = &cells[3];
        assert_close(low.pension_growth, 0.02, 1e-12);
        assert_close(high.savings_growth, 0.06, 1e-12);
        // Same strategy, more growth: never poorer at the end.
        let name = "Gradual/ISAFirst/Normal";
        let balance = |cell: &SensitivityCell| {
            cell.strategies
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.final_balance)
                .expect("strategy present")
        };
        assert!(balance(high) >= balance(low));
    }

    #[test]
    fn depletion_sensitivity_rises_with_growth() {
        let mut config = single_config();
        config.sensitivity = grid((0.0, 0.04), (0.0, 0.0), 0.04);
        let solve = DepletionSolveConfig {
            target_age: Some(80),
            tolerance: 5.0,
            pension_only: true,
            ..DepletionSolveConfig::default()
        };
        let cells = run_depletion_sensitivity(&config, &solve).expect("must solve");
        assert_eq!(cells.len(), 2);
        for cell in &cells {
            assert_eq!(cell.strategies.len(), 1);
            assert_eq!(cell.best_strategy.as_deref(), Some("Gradual/PenOnly/Normal"));
        }
        let flat = cells[0].best_monthly.expect("solved");
        let grown = cells[1].best_monthly.expect("solved");
        assert!(grown > flat, "{grown} should exceed {flat}");
    }

    #[test]
    fn invalid_solver_settings_fail_the_sweep() {
        let mut config = single_config();
        config.sensitivity = grid((0.04, 0.04), (0.04, 0.04), 0.01);
        let solve = DepletionSolveConfig {
            tolerance: 0.0,
            ..DepletionSolveConfig::default()
        };
        assert!(matches!(
            run_depletion_sensitivity(&config, &solve),
            Err(SolverError::InvalidConfig(_))
        ));
    }
}
