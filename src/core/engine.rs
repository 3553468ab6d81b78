use std::collections::BTreeMap;

use tracing::debug;

use super::config::{Config, TierKind};
use super::crystallisation::take_pcls_lump_sum;
use super::growth::{GlidePath, GrowthRates, apply_growth};
use super::guardrails::GuardrailsState;
use super::tax::{TaxSchedule, calculate_tax_with_tapering};
use super::types::{
    GuardrailDirection, MortgageOption, Person, PersonBalances, PersonPhase, SimulationParams,
    SimulationResult, WithdrawalBreakdown, YearState,
};
use super::withdrawal::{DrawdownContext, execute_drawdown};

/// Balance below which a household that still needs income has run out.
const DEPLETION_FLOOR: f64 = 1_000.0;
/// Unmet need tolerated before a year counts as a shortfall.
const SHORTFALL_TOLERANCE: f64 = 1.0;

pub fn run_simulation(config: &Config, params: &SimulationParams) -> SimulationResult {
    SimulationRunner::new(config, params, None).run()
}

/// Runs with the income requirement fixed at `monthly` per ratio unit, ignoring tier amounts and VPW.
pub fn run_simulation_with_income(
    config: &Config,
    params: &SimulationParams,
    monthly: f64,
) -> SimulationResult {
    SimulationRunner::new(config, params, Some(monthly.max(0.0))).run()
}

fn assert_finite(year: i32, what: &str, value: f64) {
    assert!(
        value.is_finite(),
        "non-finite {what} ({value}) in simulated year {year}"
    );
}

fn compound(rate: f64, years: i32) -> f64 {
    (1.0 + rate).powi(years.max(0))
}

/// Guaranteed income for one person in one year, before tax.
#[derive(Debug, Clone, Copy, Default)]
struct GuaranteedIncome {
    state_pension: f64,
    db_pension: f64,
    work: f64,
}

impl GuaranteedIncome {
    fn total(&self) -> f64 {
        self.state_pension + self.db_pension + self.work
    }
}

struct SimulationRunner<'a> {
    config: &'a Config,
    params: &'a SimulationParams,
    income_override: Option<f64>,
    people: Vec<Person>,
    schedule: TaxSchedule,
    glide: Option<GlidePath>,
    guardrails: GuardrailsState,
    income_ref: usize,
    initial_portfolio: f64,
    start_year: i32,
    end_year: i32,
}

impl<'a> SimulationRunner<'a> {
    fn new(config: &'a Config, params: &'a SimulationParams, income_override: Option<f64>) -> Self {
        let mut people = config.build_people();
        for person in &mut people {
            person.state_pension_defer_years = person
                .state_pension_defer_years
                .max(params.state_pension_defer_years);
        }

        let start_year = config.simulation.start_year;
        let glide = config.financial.glide_path.as_ref().map(|path| {
            let reference = path
                .reference_person
                .as_deref()
                .and_then(|name| config.find_person(name))
                .unwrap_or_else(|| config.simulation_reference());
            GlidePath {
                pension_end_rate: path.pension_end_rate,
                savings_end_rate: path.savings_end_rate,
                start_year,
                target_year: reference.birth_year() + path.target_age as i32,
            }
        });

        let income_name = &config.income_reference().name;
        let income_ref = people
            .iter()
            .position(|person| &person.name == income_name)
            .unwrap_or(0);
        let initial_portfolio = people.iter().map(Person::total_wealth).sum();

        Self {
            config,
            params,
            income_override,
            people,
            schedule: config.tax_schedule(),
            glide,
            guardrails: GuardrailsState::new(config.income.guardrails),
            income_ref,
            initial_portfolio,
            start_year,
            end_year: config.end_year(),
        }
    }

    fn run(mut self) -> SimulationResult {
        let mut years = Vec::with_capacity((self.end_year - self.start_year + 1).max(0) as usize);
        let mut ran_out_year = None;

        let mut year = self.start_year;
        while year <= self.end_year {
            let (state, ran_out) = self.step(year);
            if ran_out && ran_out_year.is_none() {
                ran_out_year = Some(year);
            }
            let exhausted = state.total_balance <= 1.0;
            years.push(state);
            year += 1;

            if exhausted && !self.has_future_income(year) {
                let still_needed = (year..=self.end_year).any(|y| self.is_income_phase(y));
                if still_needed && ran_out_year.is_none() && year <= self.end_year {
                    ran_out_year = Some(year);
                }
                while year <= self.end_year {
                    years.push(self.depleted_year(year));
                    year += 1;
                }
            }
        }

        let final_balances: BTreeMap<String, PersonBalances> = self
            .people
            .iter()
            .map(|person| (person.name.clone(), person.balances()))
            .collect();

        SimulationResult {
            params: self.params.clone(),
            name: self.params.short_name(),
            total_tax_paid: years.iter().map(|y| y.total_tax_paid).sum(),
            total_withdrawn: years.iter().map(|y| y.withdrawals.total_withdrawn()).sum(),
            total_isa_deposits: years.iter().map(|y| y.withdrawals.total_isa_deposits).sum(),
            ran_out_of_money: ran_out_year.is_some(),
            ran_out_year,
            final_balances,
            years,
        }
    }

    fn income_reference(&self) -> &Person {
        &self.people[self.income_ref]
    }

    fn is_income_phase(&self, year: i32) -> bool {
        self.income_reference().is_retired(year)
    }

    fn has_future_income(&self, from_year: i32) -> bool {
        (from_year..=self.end_year).any(|year| {
            self.people
                .iter()
                .any(|person| self.guaranteed_income(person, year).total() > 0.0)
        })
    }

    /// Guaranteed income without side effects; the DB lump sum is handled in [`Self::step`].
    fn guaranteed_income(&self, person: &Person, year: i32) -> GuaranteedIncome {
        let financial = &self.config.financial;
        let mut income = GuaranteedIncome::default();

        if person.receives_state_pension(year) && financial.state_pension_amount > 0.0 {
            let first_year = person.birth_year + person.effective_state_pension_age() as i32;
            income.state_pension = person.deferred_state_pension(financial.state_pension_amount)
                * compound(financial.state_pension_inflation, year - first_year);
        }
        if let Some(db) = person.db_pension.filter(|_| person.receives_db_pension(year)) {
            let first_year = person.birth_year + db.start_age as i32;
            income.db_pension =
                db.effective_annual() * compound(financial.state_pension_inflation, year - first_year);
        }

        let wage_growth = compound(financial.income_inflation_rate, year - self.start_year);
        if person.receives_salary(year) {
            income.work += person.work_income * wage_growth;
        }
        if let Some(work) = person.part_time.filter(|_| person.receives_part_time_income(year)) {
            income.work += work.annual_income * wage_growth;
        }
        income
    }

    fn inflation_since_retirement(&self, year: i32) -> f64 {
        let reference = self.income_reference();
        let retirement_year = reference.birth_year + reference.retirement_age as i32;
        compound(self.config.financial.income_inflation_rate, year - retirement_year)
    }

    /// Un-inflated annual requirement, or `None` for an investment-gains tier.
    fn base_annual_income(&self, age: u32) -> Option<f64> {
        let tier = self.config.income.tier_for_age(age);
        if let Some(monthly) = self.income_override {
            let ratio = tier.and_then(|tier| tier.ratio).unwrap_or(1.0);
            return Some(monthly * 12.0 * ratio);
        }
        match tier.map(|tier| tier.kind) {
            None => Some(0.0),
            Some(TierKind::Fixed { monthly }) => Some(monthly * 12.0),
            Some(TierKind::Percentage { annual_percent }) => {
                Some(self.initial_portfolio * annual_percent / 100.0)
            }
            Some(TierKind::InvestmentGains) => None,
        }
    }

    fn investment_gains(&self, rates: GrowthRates, portfolio: f64) -> f64 {
        let pension: f64 = self.people.iter().map(Person::total_pension).sum();
        let isa: f64 = self.people.iter().map(|p| p.tax_free_savings).sum();
        let gains = pension * rates.pension + isa * rates.savings
            - portfolio * self.config.financial.income_inflation_rate;
        gains.max(0.0)
    }

    /// Takes the lump sum for everyone eligible and applies it to the mortgage. Returns cash used.
    fn pay_mortgage_from_pcls(
        &mut self,
        year: i32,
        mortgage_cost: f64,
        pcls: &mut BTreeMap<String, f64>,
    ) -> f64 {
        let mut taken = Vec::new();
        for person in &mut self.people {
            let eligible = person.can_access_pension(year)
                && !person.pcls_taken
                && person.uncrystallised_pot > 0.0;
            if eligible {
                taken.push(take_pcls_lump_sum(person).tax_free_portion);
            } else {
                taken.push(0.0);
            }
        }
        let total: f64 = taken.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let used = total.min(mortgage_cost);
        for (person, tax_free) in self.people.iter_mut().zip(taken) {
            let share = used * tax_free / total;
            if share > 0.0 {
                person.tax_free_savings -= share;
                pcls.insert(person.name.clone(), share);
            }
        }
        used
    }

    fn phase_of(&self, person: &Person, year: i32, breakdown: &WithdrawalBreakdown) -> PersonPhase {
        let withdrew = breakdown.pension_drawn_by(&person.name) > 0.0
            || breakdown.tax_free_from_isa.contains_key(&person.name);
        if person.total_wealth() <= 1.0 {
            PersonPhase::Depleted
        } else if !person.can_access_pension(year) {
            PersonPhase::PreAccess
        } else if withdrew {
            PersonPhase::Drawdown
        } else {
            PersonPhase::AccessibleNoWithdrawal
        }
    }

    fn ages(&self, year: i32) -> BTreeMap<String, u32> {
        self.people
            .iter()
            .filter_map(|person| person.age_in(year).map(|age| (person.name.clone(), age)))
            .collect()
    }

    fn depleted_year(&self, year: i32) -> YearState {
        YearState {
            year,
            ages: self.ages(year),
            phases: self
                .people
                .iter()
                .map(|person| (person.name.clone(), PersonPhase::Depleted))
                .collect(),
            start_balances: self
                .people
                .iter()
                .map(|person| (person.name.clone(), PersonBalances::default()))
                .collect(),
            end_balances: self
                .people
                .iter()
                .map(|person| (person.name.clone(), PersonBalances::default()))
                .collect(),
            ..YearState::default()
        }
    }

    /// Simulates one tax year. Returns the closed year and whether the household ran short.
    fn step(&mut self, year: i32) -> (YearState, bool) {
        let config = self.config;
        let financial = &config.financial;
        let mut state = YearState {
            year,
            ..YearState::default()
        };

        let rates = GrowthRates::for_year(financial.base_growth(), self.glide.as_ref(), year);
        state.pension_growth_rate = rates.pension;
        state.savings_growth_rate = rates.savings;
        if year > self.start_year {
            for person in &mut self.people {
                apply_growth(person, rates);
            }
        }
        state.start_balances = self
            .people
            .iter()
            .map(|person| (person.name.clone(), person.balances()))
            .collect();
        state.start_balance = self.people.iter().map(Person::total_wealth).sum();
        state.ages = self.ages(year);

        let mut guaranteed = BTreeMap::new();
        for idx in 0..self.people.len() {
            let income = self.guaranteed_income(&self.people[idx], year);
            let person = &mut self.people[idx];
            if let Some(db) = person.db_pension.filter(|_| !person.db_lump_sum_taken) {
                // Lump sums taken before the simulation window are already in the ISA.
                // Full commutation leaves no income, so gate on the start year alone.
                if db.commutation > 0.0 && year == person.birth_year + db.start_age as i32 {
                    person.tax_free_savings += db.lump_sum();
                    person.db_lump_sum_taken = true;
                }
            }
            if income.state_pension > 0.0 {
                state
                    .state_pension_by_person
                    .insert(person.name.clone(), income.state_pension);
            }
            if income.db_pension > 0.0 {
                state
                    .db_pension_by_person
                    .insert(person.name.clone(), income.db_pension);
            }
            if income.work > 0.0 {
                state
                    .work_income_by_person
                    .insert(person.name.clone(), income.work);
            }
            guaranteed.insert(person.name.clone(), income.total());
        }

        let income_phase = self.is_income_phase(year);
        let reference_age = self.income_reference().age_in(year).unwrap_or(0);
        let inflation = self.inflation_since_retirement(year);
        if income_phase {
            let base = self.base_annual_income(reference_age);
            let mut required = match base {
                Some(annual) => annual * inflation,
                None => self.investment_gains(rates, state.start_balance),
            };

            if self.params.guardrails && required > 0.0 {
                let was_initialised = self.guardrails.is_initialised();
                let outcome = self.guardrails.adjust(
                    state.start_balance,
                    required,
                    financial.income_inflation_rate,
                );
                if was_initialised {
                    state.guardrails = outcome.direction;
                    state.guardrails_adjusted = Some(outcome.withdrawal);
                }
                required = outcome.withdrawal;
            }

            let vpw = &config.income.vpw;
            if vpw.enabled && self.income_override.is_none() {
                let suggestion = vpw.suggest(state.start_balance, reference_age, inflation);
                state.vpw_rate = Some(suggestion.rate);
                state.vpw_suggested_income = Some(suggestion.income);
                required = suggestion.income;
            }
            state.required_income = required;
        }
        if state.guardrails_adjusted.is_none() {
            state.guardrails = GuardrailDirection::Unchanged;
        }

        if financial.emergency_fund_months > 0 {
            let annual = if financial.emergency_fund_inflation_adjust || !income_phase {
                state.required_income
            } else {
                self.base_annual_income(reference_age)
                    .unwrap_or(state.required_income)
            };
            let per_person = annual / 12.0 * financial.emergency_fund_months as f64
                / self.people.len() as f64;
            for person in &mut self.people {
                person.emergency_fund_minimum = per_person;
            }
        }

        let option = self.params.mortgage_option;
        state.mortgage_cost = config.mortgage.cost_for_year(year, option);
        let mut pcls = BTreeMap::new();
        if option == MortgageOption::PclsPayoff
            && state.mortgage_cost > 0.0
            && year == config.mortgage.payoff_year(option)
        {
            state.pcls_used_for_mortgage =
                self.pay_mortgage_from_pcls(year, state.mortgage_cost, &mut pcls);
        }
        state.total_required = state.required_income + state.mortgage_cost;

        let schedule = self
            .schedule
            .inflated(self.start_year, year, financial.tax_band_inflation);
        state.personal_allowance = schedule.personal_allowance();
        state.basic_rate_limit = schedule.basic_rate_limit();

        state.guaranteed_income = guaranteed.values().sum();
        state.guaranteed_income_tax = guaranteed
            .values()
            .map(|income| calculate_tax_with_tapering(*income, &schedule))
            .sum();
        let guaranteed_net = state.guaranteed_income - state.guaranteed_income_tax;
        let spare_guaranteed = (guaranteed_net - state.required_income).max(0.0);
        state.net_income_required = (state.required_income - guaranteed_net).max(0.0);
        state.net_mortgage_required =
            (state.mortgage_cost - state.pcls_used_for_mortgage - spare_guaranteed).max(0.0);
        state.net_required = state.net_income_required + state.net_mortgage_required;

        let ctx = DrawdownContext {
            year,
            crystallisation: self.params.crystallisation,
            order: self.params.drawdown_order,
            maximize_couple_isa: self.params.maximize_couple_isa,
            schedule: &schedule,
            guaranteed_taxable: &guaranteed,
            state_pension: &state.state_pension_by_person,
            retired: income_phase,
        };
        let mut withdrawals = execute_drawdown(&mut self.people, state.net_required, &ctx);
        let drawn = withdrawals.total_withdrawn();
        for (name, amount) in &pcls {
            withdrawals.record_tax_free_pension(name, *amount);
        }

        for person in &self.people {
            let income = guaranteed.get(&person.name).copied().unwrap_or(0.0);
            let taxable = income + withdrawals.taxable_for(&person.name);
            let tax = calculate_tax_with_tapering(taxable, &schedule);
            if tax > 0.0 {
                state.tax_by_person.insert(person.name.clone(), tax);
            }
            state.total_tax_paid += tax;
        }
        state.net_income_received = state.guaranteed_income + withdrawals.total_withdrawn()
            - withdrawals.total_isa_deposits
            - state.total_tax_paid;

        state.phases = self
            .people
            .iter()
            .map(|person| (person.name.clone(), self.phase_of(person, year, &withdrawals)))
            .collect();
        state.end_balances = self
            .people
            .iter()
            .map(|person| (person.name.clone(), person.balances()))
            .collect();
        state.total_balance = self.people.iter().map(Person::total_wealth).sum();

        let withdrawal_tax = state.total_tax_paid - state.guaranteed_income_tax;
        let net_from_pots = drawn - withdrawals.total_isa_deposits - withdrawal_tax;
        let shortfall = state.net_required - net_from_pots;
        let ran_out = state.net_required > 0.0
            && (shortfall > SHORTFALL_TOLERANCE || state.total_balance < DEPLETION_FLOOR);
        state.withdrawals = withdrawals;

        assert_finite(year, "required income", state.total_required);
        assert_finite(year, "tax paid", state.total_tax_paid);
        assert_finite(year, "net income", state.net_income_received);
        assert_finite(year, "total balance", state.total_balance);

        debug!(
            year,
            required = state.total_required,
            withdrawn = drawn,
            balance = state.total_balance,
            ran_out,
            "simulated year"
        );
        (state, ran_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::fixtures::{sample_config, single_config};
    use crate::core::config::{DbPensionConfig, IncomeTier};
    use crate::core::types::{CrystallisationStrategy, DrawdownOrder};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn params(order: DrawdownOrder) -> SimulationParams {
        SimulationParams {
            drawdown_order: order,
            ..SimulationParams::default()
        }
    }

    fn flat_tier(monthly: f64) -> IncomeTier {
        IncomeTier {
            start_age: None,
            end_age: None,
            kind: TierKind::Fixed { monthly },
            ratio: None,
        }
    }

    #[test]
    fn result_covers_full_horizon() {
        let config = sample_config();
        let result = run_simulation(&config, &SimulationParams::default());
        let expected = (config.end_year() - config.simulation.start_year + 1) as usize;
        assert_eq!(result.years.len(), expected);
        assert_eq!(result.years[0].year, 2025);
        assert_eq!(result.years.last().map(|y| y.year), Some(config.end_year()));
        assert_eq!(result.name, "Gradual/TaxOpt/Normal");
    }

    #[test]
    fn first_year_has_no_growth() {
        let config = single_config();
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        assert_approx_tol(result.years[0].start_balance, 700_000.0, 1e-6);
        let second = &result.years[1];
        let expected = result.years[0].total_balance * 1.05;
        assert_approx_tol(second.start_balance, expected, 1e-6);
    }

    #[test]
    fn funded_years_deliver_required_income() {
        let config = single_config();
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        assert!(!result.ran_out_of_money);
        for state in result.years.iter().take(10) {
            assert_approx_tol(state.net_income_received, state.total_required, 2.0);
        }
    }

    #[test]
    fn income_only_required_after_reference_retires() {
        let mut config = single_config();
        config.people[0].retirement_age = Some(62);
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        let at = |year: i32| result.year(year).map(|s| s.required_income).unwrap_or(-1.0);
        assert_eq!(at(2025), 0.0);
        assert_eq!(at(2027), 0.0);
        assert_approx_tol(at(2028), 3_500.0 * 12.0, 1e-6);
        assert_approx_tol(at(2029), 3_500.0 * 12.0 * 1.025, 1e-6);
    }

    #[test]
    fn income_inflates_from_retirement_year() {
        let config = single_config();
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        let retirement_year = 1966 + 57;
        let expected = 3_500.0 * 12.0 * 1.025_f64.powi(2025 - retirement_year);
        assert_approx_tol(result.years[0].required_income, expected, 1e-6);
    }

    #[test]
    fn tax_totals_are_consistent() {
        let config = sample_config();
        let result = run_simulation(&config, &params(DrawdownOrder::TaxOptimized));
        for state in &result.years {
            let sum: f64 = state.tax_by_person.values().sum();
            assert_approx_tol(sum, state.total_tax_paid, 1e-6);
        }
        let total: f64 = result.years.iter().map(|y| y.total_tax_paid).sum();
        assert_approx_tol(result.total_tax_paid, total, 1e-6);
    }

    #[test]
    fn deferred_state_pension_is_enhanced() {
        let mut config = single_config();
        config.financial.state_pension_amount = 10_000.0;
        config.financial.state_pension_inflation = 0.0;
        let deferred = SimulationParams {
            state_pension_defer_years: 2,
            ..params(DrawdownOrder::PensionFirst)
        };
        let result = run_simulation(&config, &deferred);
        let at_67 = result.year(1966 + 67).expect("year exists");
        assert!(!at_67.state_pension_by_person.contains_key("Alex"));
        let at_69 = result.year(1966 + 69).expect("year exists");
        assert_approx_tol(at_69.state_pension_by_person["Alex"], 10_000.0 * 1.058_f64.powi(2), 1e-6);
    }

    #[test]
    fn db_commutation_pays_lump_sum_into_isa() {
        let mut config = single_config();
        config.income.tiers = vec![flat_tier(0.0)];
        config.financial.savings_growth_rate = 0.0;
        config.financial.state_pension_inflation = 0.0;
        config.people[0].db_pension = Some(DbPensionConfig {
            name: "Civil Service".to_string(),
            annual_amount: 20_000.0,
            start_age: 60,
            normal_age: Some(60),
            early_factor: 0.0,
            late_factor: 0.0,
            commutation: 0.25,
            commute_factor: None,
        });
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        let first = result.year(2026).expect("year exists");
        assert_approx_tol(first.db_pension_by_person["Alex"], 15_000.0, 1e-6);
        let isa_gain = first.end_balances["Alex"].tax_free_savings - first.start_balances["Alex"].tax_free_savings;
        assert_approx_tol(isa_gain, 5_000.0 * 12.0, 1e-6);
        let next = result.year(2027).expect("year exists");
        assert_approx_tol(
            next.end_balances["Alex"].tax_free_savings - next.start_balances["Alex"].tax_free_savings,
            0.0,
            1e-6,
        );
    }

    #[test]
    fn full_commutation_still_pays_lump_sum() {
        let mut config = single_config();
        config.income.tiers = vec![flat_tier(0.0)];
        config.financial.savings_growth_rate = 0.0;
        config.people[0].db_pension = Some(DbPensionConfig {
            name: "Civil Service".to_string(),
            annual_amount: 20_000.0,
            start_age: 60,
            normal_age: Some(60),
            early_factor: 0.0,
            late_factor: 0.0,
            commutation: 1.0,
            commute_factor: None,
        });
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        let first = result.year(2026).expect("year exists");
        assert!(!first.db_pension_by_person.contains_key("Alex"));
        let isa_gain = first.end_balances["Alex"].tax_free_savings - first.start_balances["Alex"].tax_free_savings;
        assert_approx_tol(isa_gain, 20_000.0 * 12.0, 1e-6);
        let next = result.year(2027).expect("year exists");
        assert_approx_tol(
            next.end_balances["Alex"].tax_free_savings - next.start_balances["Alex"].tax_free_savings,
            0.0,
            1e-6,
        );
    }

    #[test]
    fn pcls_payoff_clears_mortgage_and_keeps_excess_in_isa() {
        let config = sample_config();
        let pcls = SimulationParams {
            mortgage_option: MortgageOption::PclsPayoff,
            ..params(DrawdownOrder::PensionFirst)
        };
        let result = run_simulation(&config, &pcls);
        let payoff = result.year(2028).expect("payoff year");
        let balance = config.mortgage.parts[0].remaining_balance(2028);
        assert_approx_tol(payoff.mortgage_cost, balance, 1e-6);
        assert_approx_tol(payoff.pcls_used_for_mortgage, balance, 1e-6);
        assert_approx_tol(payoff.net_mortgage_required, 0.0, 1e-6);
        assert!(payoff.end_balances["Alex"].crystallised_pot > 0.0);
        assert_eq!(payoff.end_balances["Alex"].uncrystallised_pot, 0.0);
        let after = result.year(2029).expect("year after payoff");
        assert_eq!(after.mortgage_cost, 0.0);
    }

    #[test]
    fn early_payoff_pays_balance_then_nothing() {
        let config = sample_config();
        let early = SimulationParams {
            mortgage_option: MortgageOption::Early,
            ..params(DrawdownOrder::PensionFirst)
        };
        let result = run_simulation(&config, &early);
        let part = &config.mortgage.parts[0];
        assert_approx_tol(result.years[0].mortgage_cost, part.annual_payment(), 1e-6);
        assert_approx_tol(
            result.year(2028).map(|s| s.mortgage_cost).unwrap_or_default(),
            part.remaining_balance(2028),
            1e-6,
        );
        assert_eq!(result.year(2030).map(|s| s.mortgage_cost), Some(0.0));
    }

    #[test]
    fn overspending_household_runs_out_and_is_padded() {
        let mut config = single_config();
        config.people[0].pension = 50_000.0;
        config.people[0].tax_free_savings = 20_000.0;
        config.income.tiers = vec![flat_tier(5_000.0)];
        let result = run_simulation(&config, &params(DrawdownOrder::SavingsFirst));
        assert!(result.ran_out_of_money);
        assert_eq!(result.ran_out_year, Some(2026));
        let expected = (config.end_year() - 2025 + 1) as usize;
        assert_eq!(result.years.len(), expected);
        let last = result.years.last().expect("padded years");
        assert_eq!(last.total_balance, 0.0);
        assert_eq!(last.phases["Alex"], PersonPhase::Depleted);
    }

    #[test]
    fn investment_gains_tier_tracks_real_return() {
        let mut config = single_config();
        config.income.tiers = vec![IncomeTier {
            kind: TierKind::InvestmentGains,
            ..flat_tier(0.0)
        }];
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        let first = &result.years[0];
        let expected = 700_000.0 * (0.05 - 0.025);
        assert_approx_tol(first.required_income, expected, 1e-6);
    }

    #[test]
    fn vpw_overrides_tier_income() {
        let mut config = single_config();
        config.income.vpw.enabled = true;
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        let first = &result.years[0];
        assert_eq!(first.vpw_rate, Some(0.034));
        assert_approx_tol(first.required_income, 700_000.0 * 0.034, 1e-6);

        let solved = run_simulation_with_income(&config, &params(DrawdownOrder::PensionFirst), 1_000.0);
        assert_eq!(solved.years[0].vpw_rate, None);
        assert_approx_tol(solved.years[0].required_income, 12_000.0 * 5.0 * 1.025_f64.powi(2), 1e-6);
    }

    #[test]
    fn guardrails_record_direction_after_first_year() {
        let mut config = single_config();
        config.financial.pension_growth_rate = 0.15;
        config.financial.savings_growth_rate = 0.15;
        let with_rails = SimulationParams {
            guardrails: true,
            ..params(DrawdownOrder::PensionFirst)
        };
        let result = run_simulation(&config, &with_rails);
        assert_eq!(result.years[0].guardrails_adjusted, None);
        assert!(result
            .years
            .iter()
            .any(|state| state.guardrails == GuardrailDirection::Increased));
        assert_eq!(result.name, "Gradual/PenFirst/Normal/GK");
    }

    #[test]
    fn phases_follow_access_age() {
        let mut config = sample_config();
        config.people[1].pension_access_age = 58;
        let result = run_simulation(&config, &params(DrawdownOrder::PensionFirst));
        let first = &result.years[0];
        assert_eq!(first.phases["Sam"], PersonPhase::PreAccess);
        assert_eq!(first.phases["Alex"], PersonPhase::Drawdown);
    }

    #[test]
    fn ufpls_never_builds_a_crystallised_pot() {
        let config = single_config();
        let ufpls = SimulationParams {
            crystallisation: CrystallisationStrategy::Ufpls,
            ..params(DrawdownOrder::PensionFirst)
        };
        let result = run_simulation(&config, &ufpls);
        assert!(result
            .years
            .iter()
            .all(|state| state.end_balances["Alex"].crystallised_pot == 0.0));
    }

    #[test]
    fn runs_are_deterministic() {
        let config = sample_config();
        let p = params(DrawdownOrder::PensionToIsa);
        let first = serde_json::to_string(&run_simulation(&config, &p)).expect("serialise");
        let second = serde_json::to_string(&run_simulation(&config, &p)).expect("serialise");
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "non-finite")]
    fn nan_rates_fail_loudly() {
        let mut config = single_config();
        config.financial.income_inflation_rate = f64::NAN;
        run_simulation(&config, &params(DrawdownOrder::PensionFirst));
    }
}
