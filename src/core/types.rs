use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrystallisationStrategy {
    Gradual,
    Ufpls,
}

impl CrystallisationStrategy {
    pub const ALL: [CrystallisationStrategy; 2] = [Self::Gradual, Self::Ufpls];

    pub fn short_name(self) -> &'static str {
        match self {
            Self::Gradual => "Gradual",
            Self::Ufpls => "UFPLS",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrawdownOrder {
    SavingsFirst,
    PensionFirst,
    TaxOptimized,
    PensionToIsa,
    PensionToIsaProactive,
    PensionOnly,
    FillBasicRate,
    StatePensionBridge,
}

impl DrawdownOrder {
    /// Orders enumerated by every strategy matrix.
    pub const BASE: [DrawdownOrder; 6] = [
        Self::SavingsFirst,
        Self::PensionFirst,
        Self::TaxOptimized,
        Self::PensionToIsa,
        Self::FillBasicRate,
        Self::StatePensionBridge,
    ];

    pub const ADD_ONS: [DrawdownOrder; 2] = [Self::PensionOnly, Self::PensionToIsaProactive];

    pub fn short_name(self) -> &'static str {
        match self {
            Self::SavingsFirst => "ISAFirst",
            Self::PensionFirst => "PenFirst",
            Self::TaxOptimized => "TaxOpt",
            Self::PensionToIsa => "Pen2ISA",
            Self::PensionToIsaProactive => "Pen2ISA+",
            Self::PensionOnly => "PenOnly",
            Self::FillBasicRate => "FillBasic",
            Self::StatePensionBridge => "SPBridge",
        }
    }

    /// Variants that crystallise whole slices of the pot and so only make sense gradually.
    pub fn requires_gradual(self) -> bool {
        matches!(self, Self::PensionToIsa | Self::PensionToIsaProactive)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MortgageOption {
    Early,
    Normal,
    /// Term extended by ten years beyond the normal end year.
    Extended,
    /// Mortgage cleared at the early payoff year from the 25% pension lump sum.
    PclsPayoff,
}

impl MortgageOption {
    pub const ALL: [MortgageOption; 4] = [Self::Early, Self::Normal, Self::Extended, Self::PclsPayoff];

    pub fn short_name(self) -> &'static str {
        match self {
            Self::Early => "Early",
            Self::Normal => "Normal",
            Self::Extended => "Ext+10",
            Self::PclsPayoff => "PCLS",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationParams {
    pub crystallisation: CrystallisationStrategy,
    pub drawdown_order: DrawdownOrder,
    pub mortgage_option: MortgageOption,
    pub guardrails: bool,
    pub state_pension_defer_years: u32,
    pub maximize_couple_isa: bool,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            crystallisation: CrystallisationStrategy::Gradual,
            drawdown_order: DrawdownOrder::TaxOptimized,
            mortgage_option: MortgageOption::Normal,
            guardrails: false,
            state_pension_defer_years: 0,
            maximize_couple_isa: true,
        }
    }
}

impl SimulationParams {
    pub fn short_name(&self) -> String {
        let mut name = format!(
            "{}/{}/{}",
            self.crystallisation.short_name(),
            self.drawdown_order.short_name(),
            self.mortgage_option.short_name()
        );
        if self.guardrails {
            name.push_str("/GK");
        }
        if self.state_pension_defer_years > 0 {
            name.push_str(&format!("/SPDefer{}", self.state_pension_defer_years));
        }
        name
    }
}

impl fmt::Display for SimulationParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbPension {
    pub annual_amount: f64,
    pub start_age: u32,
    pub normal_age: u32,
    pub early_factor: f64,
    pub late_factor: f64,
    pub commutation: f64,
    pub commute_factor: f64,
}

impl DbPension {
    /// Annual pension after early/late adjustment, before commutation.
    fn adjusted_amount(&self) -> f64 {
        let mut amount = self.annual_amount;
        if self.normal_age > 0 && self.start_age > 0 {
            if self.start_age < self.normal_age && self.early_factor > 0.0 {
                let years_early = (self.normal_age - self.start_age) as f64;
                amount *= (1.0 - years_early * self.early_factor).max(0.0);
            } else if self.start_age > self.normal_age && self.late_factor > 0.0 {
                let years_late = (self.start_age - self.normal_age) as f64;
                amount *= 1.0 + years_late * self.late_factor;
            }
        }
        amount
    }

    pub fn effective_annual(&self) -> f64 {
        if self.annual_amount <= 0.0 {
            return 0.0;
        }
        self.adjusted_amount() * (1.0 - self.commutation.clamp(0.0, 1.0))
    }

    pub fn lump_sum(&self) -> f64 {
        if self.annual_amount <= 0.0 || self.commutation <= 0.0 {
            return 0.0;
        }
        let given_up = self.adjusted_amount() * self.commutation.clamp(0.0, 1.0);
        let factor = if self.commute_factor > 0.0 {
            self.commute_factor
        } else {
            12.0
        };
        given_up * factor
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartTimeWork {
    pub annual_income: f64,
    pub start_age: u32,
    pub end_age: u32,
}

/// One household member's state for a single simulation run.
///
/// Each run owns its own `Vec<Person>`; strategy simulations never share one.
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub name: String,
    pub birth_year: i32,
    pub pension_access_age: u32,
    pub retirement_age: u32,
    pub state_pension_age: u32,
    pub tax_free_savings: f64,
    pub uncrystallised_pot: f64,
    pub crystallised_pot: f64,
    pub pcls_taken: bool,
    pub isa_annual_limit: f64,
    pub db_pension: Option<DbPension>,
    pub db_lump_sum_taken: bool,
    pub state_pension_defer_years: u32,
    pub state_pension_deferral_rate: f64,
    pub emergency_fund_minimum: f64,
    pub work_income: f64,
    pub part_time: Option<PartTimeWork>,
}

impl Person {
    pub fn age_in(&self, year: i32) -> Option<u32> {
        u32::try_from(year - self.birth_year).ok()
    }

    pub fn available_isa(&self) -> f64 {
        (self.tax_free_savings - self.emergency_fund_minimum).max(0.0)
    }

    pub fn total_pension(&self) -> f64 {
        self.uncrystallised_pot + self.crystallised_pot
    }

    pub fn total_wealth(&self) -> f64 {
        self.tax_free_savings + self.total_pension()
    }

    pub fn can_access_pension(&self, year: i32) -> bool {
        self.age_in(year)
            .is_some_and(|age| age >= self.pension_access_age)
    }

    pub fn is_retired(&self, year: i32) -> bool {
        self.age_in(year).is_some_and(|age| age >= self.retirement_age)
    }

    pub fn effective_state_pension_age(&self) -> u32 {
        self.state_pension_age + self.state_pension_defer_years
    }

    pub fn receives_state_pension(&self, year: i32) -> bool {
        self.age_in(year)
            .is_some_and(|age| age >= self.effective_state_pension_age())
    }

    /// Base state pension compounded by the deferral enhancement.
    pub fn deferred_state_pension(&self, base_amount: f64) -> f64 {
        if self.state_pension_defer_years == 0 || self.state_pension_deferral_rate <= 0.0 {
            return base_amount;
        }
        base_amount
            * (1.0 + self.state_pension_deferral_rate).powi(self.state_pension_defer_years as i32)
    }

    pub fn receives_db_pension(&self, year: i32) -> bool {
        match (self.db_pension, self.age_in(year)) {
            (Some(db), Some(age)) => db.annual_amount > 0.0 && db.start_age > 0 && age >= db.start_age,
            _ => false,
        }
    }

    pub fn receives_part_time_income(&self, year: i32) -> bool {
        match (self.part_time, self.age_in(year)) {
            (Some(work), Some(age)) => {
                work.annual_income > 0.0 && age >= work.start_age && age < work.end_age
            }
            _ => false,
        }
    }

    pub fn receives_salary(&self, year: i32) -> bool {
        self.work_income > 0.0 && !self.is_retired(year) && self.age_in(year).is_some()
    }

    pub fn balances(&self) -> PersonBalances {
        PersonBalances {
            tax_free_savings: self.tax_free_savings,
            uncrystallised_pot: self.uncrystallised_pot,
            crystallised_pot: self.crystallised_pot,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonBalances {
    pub tax_free_savings: f64,
    pub uncrystallised_pot: f64,
    pub crystallised_pot: f64,
}

impl PersonBalances {
    pub fn total(&self) -> f64 {
        self.tax_free_savings + self.uncrystallised_pot + self.crystallised_pot
    }

    pub fn pension(&self) -> f64 {
        self.uncrystallised_pot + self.crystallised_pot
    }
}

/// Where a year's money came from and where any surplus went, keyed by person name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalBreakdown {
    pub tax_free_from_isa: BTreeMap<String, f64>,
    pub tax_free_from_pension: BTreeMap<String, f64>,
    pub taxable_from_pension: BTreeMap<String, f64>,
    pub isa_deposits: BTreeMap<String, f64>,
    pub total_tax_free: f64,
    pub total_taxable: f64,
    pub total_isa_deposits: f64,
}

impl WithdrawalBreakdown {
    pub fn record_isa(&mut self, name: &str, amount: f64) {
        if amount > 0.0 {
            *self.tax_free_from_isa.entry(name.to_string()).or_default() += amount;
            self.total_tax_free += amount;
        }
    }

    pub fn record_tax_free_pension(&mut self, name: &str, amount: f64) {
        if amount > 0.0 {
            *self.tax_free_from_pension.entry(name.to_string()).or_default() += amount;
            self.total_tax_free += amount;
        }
    }

    pub fn record_taxable(&mut self, name: &str, amount: f64) {
        if amount > 0.0 {
            *self.taxable_from_pension.entry(name.to_string()).or_default() += amount;
            self.total_taxable += amount;
        }
    }

    pub fn record_isa_deposit(&mut self, name: &str, amount: f64) {
        if amount > 0.0 {
            *self.isa_deposits.entry(name.to_string()).or_default() += amount;
            self.total_isa_deposits += amount;
        }
    }

    pub fn taxable_for(&self, name: &str) -> f64 {
        self.taxable_from_pension.get(name).copied().unwrap_or(0.0)
    }

    pub fn isa_deposit_for(&self, name: &str) -> f64 {
        self.isa_deposits.get(name).copied().unwrap_or(0.0)
    }

    pub fn pension_drawn_by(&self, name: &str) -> f64 {
        self.taxable_for(name) + self.tax_free_from_pension.get(name).copied().unwrap_or(0.0)
    }

    pub fn total_withdrawn(&self) -> f64 {
        self.total_tax_free + self.total_taxable
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersonPhase {
    PreAccess,
    AccessibleNoWithdrawal,
    Drawdown,
    Depleted,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailDirection {
    Reduced,
    #[default]
    Unchanged,
    Increased,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearState {
    pub year: i32,
    pub ages: BTreeMap<String, u32>,
    pub phases: BTreeMap<String, PersonPhase>,
    pub start_balances: BTreeMap<String, PersonBalances>,
    pub start_balance: f64,
    pub required_income: f64,
    pub mortgage_cost: f64,
    pub total_required: f64,
    pub state_pension_by_person: BTreeMap<String, f64>,
    pub db_pension_by_person: BTreeMap<String, f64>,
    pub work_income_by_person: BTreeMap<String, f64>,
    pub guaranteed_income: f64,
    pub guaranteed_income_tax: f64,
    pub pcls_used_for_mortgage: f64,
    pub net_required: f64,
    pub net_income_required: f64,
    pub net_mortgage_required: f64,
    pub withdrawals: WithdrawalBreakdown,
    pub tax_by_person: BTreeMap<String, f64>,
    pub total_tax_paid: f64,
    pub net_income_received: f64,
    pub end_balances: BTreeMap<String, PersonBalances>,
    pub total_balance: f64,
    pub guardrails: GuardrailDirection,
    pub guardrails_adjusted: Option<f64>,
    pub vpw_rate: Option<f64>,
    pub vpw_suggested_income: Option<f64>,
    pub personal_allowance: f64,
    pub basic_rate_limit: f64,
    pub pension_growth_rate: f64,
    pub savings_growth_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub params: SimulationParams,
    pub name: String,
    pub years: Vec<YearState>,
    pub total_tax_paid: f64,
    pub total_withdrawn: f64,
    pub total_isa_deposits: f64,
    pub ran_out_of_money: bool,
    pub ran_out_year: Option<i32>,
    pub final_balances: BTreeMap<String, PersonBalances>,
}

impl SimulationResult {
    pub fn final_total(&self) -> f64 {
        self.final_balances.values().map(PersonBalances::total).sum()
    }

    /// First year the household could not fund its requirement, if any.
    pub fn depletion_year(&self) -> Option<i32> {
        self.ran_out_year
    }

    /// First year the pensions alone could not carry the household: either the ISAs were drawn
    /// on or the requirement went unfunded.
    pub fn pension_depletion_year(&self) -> Option<i32> {
        let isa_tapped = self
            .years
            .iter()
            .find(|state| state.withdrawals.tax_free_from_isa.values().sum::<f64>() > 1.0)
            .map(|state| state.year);
        match (isa_tapped, self.ran_out_year) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn year(&self, year: i32) -> Option<&YearState> {
        self.years.iter().find(|state| state.year == year)
    }
}
