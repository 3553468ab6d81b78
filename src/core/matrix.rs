use std::cmp::Ordering;

use tracing::info;

use super::config::Config;
use super::engine::run_simulation;
use super::types::{
    CrystallisationStrategy, DrawdownOrder, MortgageOption, SimulationParams, SimulationResult,
};

/// UFPLS never builds a crystallised pot, so it cannot combine with policies that crystallise everything.
fn is_coherent(params: &SimulationParams) -> bool {
    params.crystallisation != CrystallisationStrategy::Ufpls
        || !(params.drawdown_order.requires_gradual()
            || params.mortgage_option == MortgageOption::PclsPayoff)
}

/// Every strategy combination worth simulating for `config`, in a stable order.
pub fn strategy_matrix(config: &Config) -> Vec<SimulationParams> {
    let mut orders = DrawdownOrder::BASE.to_vec();
    if config.strategy.include_add_on_orders {
        orders.extend(DrawdownOrder::ADD_ONS);
    }

    let mortgage_options: &[MortgageOption] = if config.has_mortgage() {
        &MortgageOption::ALL
    } else {
        &[MortgageOption::Normal]
    };

    let mut defer_options = vec![0];
    for years in &config.strategy.state_pension_defer_options {
        if !defer_options.contains(years) {
            defer_options.push(*years);
        }
    }

    let mut matrix = Vec::new();
    for crystallisation in CrystallisationStrategy::ALL {
        for &drawdown_order in &orders {
            for &mortgage_option in mortgage_options {
                for guardrails in [false, true] {
                    for &state_pension_defer_years in &defer_options {
                        let params = SimulationParams {
                            crystallisation,
                            drawdown_order,
                            mortgage_option,
                            guardrails,
                            state_pension_defer_years,
                            maximize_couple_isa: config.strategy.maximize_couple_isa,
                        };
                        if is_coherent(&params) {
                            matrix.push(params);
                        }
                    }
                }
            }
        }
    }
    matrix
}

/// Gradual pension-only drawdown under each mortgage option, for solves that keep ISAs intact.
pub fn pension_only_strategies(config: &Config) -> Vec<SimulationParams> {
    let mortgage_options: &[MortgageOption] = if config.has_mortgage() {
        &MortgageOption::ALL
    } else {
        &[MortgageOption::Normal]
    };
    mortgage_options
        .iter()
        .map(|&mortgage_option| SimulationParams {
            crystallisation: CrystallisationStrategy::Gradual,
            drawdown_order: DrawdownOrder::PensionOnly,
            mortgage_option,
            guardrails: false,
            state_pension_defer_years: 0,
            maximize_couple_isa: config.strategy.maximize_couple_isa,
        })
        .collect()
}

/// Runs one simulation per matrix cell. Output order matches [`strategy_matrix`].
pub fn run_matrix(config: &Config) -> Vec<SimulationResult> {
    let matrix = strategy_matrix(config);
    info!(strategies = matrix.len(), "running strategy matrix");
    run_all(config, &matrix)
}

pub fn run_all(config: &Config, params_list: &[SimulationParams]) -> Vec<SimulationResult> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        params_list
            .par_iter()
            .map(|params| run_simulation(config, params))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        params_list
            .iter()
            .map(|params| run_simulation(config, params))
            .collect()
    }
}

fn compare_results(a: &SimulationResult, b: &SimulationResult) -> Ordering {
    match (a.ran_out_year, b.ran_out_year) {
        (None, None) => a
            .final_total()
            .total_cmp(&b.final_total())
            .then_with(|| b.total_tax_paid.total_cmp(&a.total_tax_paid)),
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a_year), Some(b_year)) => a_year
            .cmp(&b_year)
            .then_with(|| b.total_tax_paid.total_cmp(&a.total_tax_paid)),
    }
}

/// Richest run that never runs out (ties to lowest tax); otherwise the run that lasts longest.
pub fn best_strategy(results: &[SimulationResult]) -> Option<&SimulationResult> {
    results.iter().reduce(|best, candidate| {
        if compare_results(candidate, best) == Ordering::Greater {
            candidate
        } else {
            best
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::fixtures::{sample_config, single_config};

    #[test]
    fn matrix_without_mortgage_uses_normal_only() {
        let config = single_config();
        let matrix = strategy_matrix(&config);
        assert!(
            matrix
                .iter()
                .all(|p| p.mortgage_option == MortgageOption::Normal)
        );
        // Gradual: 6 orders, UFPLS: 5 orders, each with guardrails off/on.
        assert_eq!(matrix.len(), (6 + 5) * 2);
        assert_eq!(matrix[0].short_name(), "Gradual/ISAFirst/Normal");
        assert_eq!(matrix[1].short_name(), "Gradual/ISAFirst/Normal/GK");
    }

    #[test]
    fn matrix_with_mortgage_skips_incoherent_combinations() {
        let config = sample_config();
        let matrix = strategy_matrix(&config);
        // Gradual: 6 orders x 4 options; UFPLS: 5 orders x 3 options.
        assert_eq!(matrix.len(), (6 * 4 + 5 * 3) * 2);
        assert!(matrix.iter().all(is_coherent));
        assert!(!matrix.iter().any(|p| {
            p.crystallisation == CrystallisationStrategy::Ufpls
                && p.mortgage_option == MortgageOption::PclsPayoff
        }));
    }

    #[test]
    fn add_ons_and_deferral_extend_the_matrix() {
        let mut config = single_config();
        config.strategy.include_add_on_orders = true;
        config.strategy.state_pension_defer_options = vec![0, 2, 2];
        let matrix = strategy_matrix(&config);
        // Gradual: 8 orders, UFPLS: 6 orders.
        assert_eq!(matrix.len(), (8 + 6) * 2 * 2);
        assert!(matrix.iter().any(|p| p.short_name() == "Gradual/PenOnly/Normal/SPDefer2"));
        assert!(matrix.iter().all(|p| p.maximize_couple_isa));
    }

    #[test]
    fn pension_only_strategies_follow_mortgage_options() {
        let names: Vec<String> = pension_only_strategies(&sample_config())
            .iter()
            .map(SimulationParams::short_name)
            .collect();
        assert_eq!(
            names,
            [
                "Gradual/PenOnly/Early",
                "Gradual/PenOnly/Normal",
                "Gradual/PenOnly/Ext+10",
                "Gradual/PenOnly/PCLS"
            ]
        );
        assert_eq!(pension_only_strategies(&single_config()).len(), 1);
    }

    #[test]
    fn matrix_runs_are_deterministic_and_ordered() {
        let config = sample_config();
        let first = run_matrix(&config);
        let second = run_matrix(&config);
        let names: Vec<String> = strategy_matrix(&config)
            .iter()
            .map(SimulationParams::short_name)
            .collect();
        let result_names: Vec<String> = first.iter().map(|r| r.name.clone()).collect();
        assert_eq!(result_names, names);
        assert_eq!(
            serde_json::to_string(&first).expect("serialise"),
            serde_json::to_string(&second).expect("serialise")
        );
    }

    #[test]
    fn best_strategy_prefers_survivors_then_wealth() {
        let config = sample_config();
        let results = run_matrix(&config);
        let best = best_strategy(&results).expect("non-empty");
        if results.iter().any(|r| !r.ran_out_of_money) {
            assert!(!best.ran_out_of_money);
            let richest = results
                .iter()
                .filter(|r| !r.ran_out_of_money)
                .map(SimulationResult::final_total)
                .fold(f64::MIN, f64::max);
            assert_eq!(best.final_total(), richest);
        }
        assert!(best_strategy(&[]).is_none());
    }

    #[test]
    fn best_strategy_falls_back_to_longest_lasting() {
        let mut config = single_config();
        config.people[0].pension = 60_000.0;
        config.people[0].tax_free_savings = 10_000.0;
        let results = run_all(
            &config,
            &[SimulationParams::default(), SimulationParams {
                drawdown_order: DrawdownOrder::SavingsFirst,
                ..SimulationParams::default()
            }],
        );
        assert!(results.iter().all(|r| r.ran_out_of_money));
        let best = best_strategy(&results).expect("non-empty");
        let latest = results.iter().filter_map(|r| r.ran_out_year).max();
        assert_eq!(best.ran_out_year, latest);
    }
}
