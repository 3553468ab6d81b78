mod config;
mod crystallisation;
mod engine;
mod error;
mod growth;
mod guardrails;
mod matrix;
mod mortgage;
mod sensitivity;
mod solver;
mod tax;
mod types;
mod vpw;
mod withdrawal;

pub use config::{
    BirthDate, Config, DbPensionConfig, FinancialConfig, GlidePathConfig, IncomeConfig,
    IncomeTier, PartTimeConfig, PersonConfig, SensitivityConfig, SimulationConfig,
    StrategyConfig, TaxConfig, TierKind, load_config,
};
pub use crystallisation::{
    CrystallisationResult, TAX_FREE_FRACTION, gradual_crystallise, take_pcls_lump_sum,
    ufpls_withdraw, withdraw_from_crystallised, withdraw_from_isa,
};
pub use engine::{run_simulation, run_simulation_with_income};
pub use error::{ConfigError, SolverError};
pub use growth::{GlidePath, GrowthRates, apply_growth, glide_rate};
pub use guardrails::{GuardrailsConfig, GuardrailsOutcome, GuardrailsState};
pub use matrix::{best_strategy, pension_only_strategies, run_all, run_matrix, strategy_matrix};
pub use mortgage::{MortgageConfig, MortgagePartConfig};
pub use sensitivity::{
    DepletionOutcome, DepletionSensitivityCell, SensitivityCell, StrategyOutcome, growth_grid,
    growth_rates, run_depletion_sensitivity, run_sensitivity,
};
pub use solver::{
    DepletionSolveConfig, DepletionSolveIteration, DepletionSolveResult, SolveStatus,
    best_depletion, depletion_strategies, solve_all, solve_depletion,
};
pub use tax::{
    TaxBand, TaxSchedule, calculate_marginal_tax, calculate_tax, calculate_tax_with_tapering,
    gross_up_for_tax, inflate_tax_bands, marginal_rate, uk_2024_bands,
};
pub use types::{
    CrystallisationStrategy, DbPension, DrawdownOrder, GuardrailDirection, MortgageOption,
    PartTimeWork, Person, PersonBalances, PersonPhase, SimulationParams, SimulationResult,
    WithdrawalBreakdown, YearState,
};
pub use vpw::{VpwConfig, VpwSuggestion, vpw_rate};
pub use withdrawal::{DrawdownContext, execute_drawdown};
