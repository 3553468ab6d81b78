//! Household configuration: parsing, defaults and the validation boundary.
//!
//! Everything that reaches the engine has been through [`Config::validate`], so the
//! simulation code can assume contiguous tax bands, known reference people and
//! finite, non-negative money amounts.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::growth::GrowthRates;
use super::guardrails::GuardrailsConfig;
use super::mortgage::MortgageConfig;
use super::tax::{TaxBand, TaxSchedule, uk_2024_bands};
use super::types::{DbPension, PartTimeWork, Person};
use super::vpw::VpwConfig;

/// Calendar date of birth, stored as `YYYY-MM-DD` in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BirthDate {
    pub year: i32,
    pub month: u8,
    pub day: u8,
}

impl TryFrom<String> for BirthDate {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<BirthDate> for String {
    fn from(date: BirthDate) -> Self {
        date.to_string()
    }
}

impl std::str::FromStr for BirthDate {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("birth date '{raw}' is not in YYYY-MM-DD form");
        let mut parts = raw.trim().splitn(3, '-');
        let (Some(y), Some(m), Some(d)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        if y.len() != 4 || m.len() != 2 || d.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = y.parse().map_err(|_| invalid())?;
        let month: u8 = m.parse().map_err(|_| invalid())?;
        let day: u8 = d.parse().map_err(|_| invalid())?;
        let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
        let days_in_month = match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 if leap => 29,
            2 => 28,
            _ => return Err(invalid()),
        };
        if day == 0 || day > days_in_month {
            return Err(invalid());
        }
        Ok(BirthDate { year, month, day })
    }
}

impl fmt::Display for BirthDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

fn default_access_age() -> u32 {
    57
}

fn default_state_pension_age() -> u32 {
    67
}

fn default_isa_limit() -> f64 {
    20_000.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbPensionConfig {
    #[serde(default)]
    pub name: String,
    pub annual_amount: f64,
    pub start_age: u32,
    #[serde(default)]
    pub normal_age: Option<u32>,
    #[serde(default)]
    pub early_factor: f64,
    #[serde(default)]
    pub late_factor: f64,
    #[serde(default)]
    pub commutation: f64,
    #[serde(default)]
    pub commute_factor: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartTimeConfig {
    pub annual_income: f64,
    pub start_age: u32,
    pub end_age: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonConfig {
    pub name: String,
    pub birth_date: BirthDate,
    #[serde(default = "default_access_age")]
    pub pension_access_age: u32,
    /// Age work stops; defaults to the pension access age.
    #[serde(default)]
    pub retirement_age: Option<u32>,
    #[serde(default = "default_state_pension_age")]
    pub state_pension_age: u32,
    #[serde(default)]
    pub tax_free_savings: f64,
    #[serde(default)]
    pub pension: f64,
    #[serde(default = "default_isa_limit")]
    pub isa_annual_limit: f64,
    #[serde(default)]
    pub db_pension: Option<DbPensionConfig>,
    #[serde(default)]
    pub state_pension_defer_years: u32,
    #[serde(default)]
    pub work_income: f64,
    #[serde(default)]
    pub part_time: Option<PartTimeConfig>,
}

impl PersonConfig {
    pub fn birth_year(&self) -> i32 {
        self.birth_date.year
    }

    pub fn retirement_age(&self) -> u32 {
        self.retirement_age.unwrap_or(self.pension_access_age)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlidePathConfig {
    pub pension_end_rate: f64,
    pub savings_end_rate: f64,
    pub target_age: u32,
    /// Whose age drives the glide; defaults to the simulation reference person.
    #[serde(default)]
    pub reference_person: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinancialConfig {
    pub pension_growth_rate: f64,
    pub savings_growth_rate: f64,
    pub income_inflation_rate: f64,
    pub state_pension_amount: f64,
    pub state_pension_inflation: f64,
    pub tax_band_inflation: f64,
    pub state_pension_deferral_rate: f64,
    pub emergency_fund_months: u32,
    pub emergency_fund_inflation_adjust: bool,
    pub glide_path: Option<GlidePathConfig>,
}

impl Default for FinancialConfig {
    fn default() -> Self {
        Self {
            pension_growth_rate: 0.05,
            savings_growth_rate: 0.05,
            income_inflation_rate: 0.025,
            state_pension_amount: 11_502.0,
            state_pension_inflation: 0.025,
            tax_band_inflation: 0.0,
            state_pension_deferral_rate: 0.058,
            emergency_fund_months: 0,
            emergency_fund_inflation_adjust: true,
            glide_path: None,
        }
    }
}

impl FinancialConfig {
    pub fn base_growth(&self) -> GrowthRates {
        GrowthRates {
            pension: self.pension_growth_rate,
            savings: self.savings_growth_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TierKind {
    Fixed { monthly: f64 },
    /// Annual percentage of the starting portfolio, e.g. 4.0 for 4%.
    Percentage { annual_percent: f64 },
    InvestmentGains,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IncomeTier {
    #[serde(default)]
    pub start_age: Option<u32>,
    #[serde(default)]
    pub end_age: Option<u32>,
    #[serde(flatten)]
    pub kind: TierKind,
    /// Relative weight used when solving for a sustainable income.
    #[serde(default)]
    pub ratio: Option<f64>,
}

impl IncomeTier {
    pub fn covers(&self, age: u32) -> bool {
        self.start_age.is_none_or(|start| age >= start) && self.end_age.is_none_or(|end| age < end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomeConfig {
    pub tiers: Vec<IncomeTier>,
    pub reference_person: String,
    pub guardrails: GuardrailsConfig,
    pub vpw: VpwConfig,
    pub target_depletion_age: Option<u32>,
}

impl IncomeConfig {
    /// First tier covering `age`, falling back to the last tier.
    pub fn tier_for_age(&self, age: u32) -> Option<&IncomeTier> {
        self.tiers
            .iter()
            .find(|tier| tier.covers(age))
            .or_else(|| self.tiers.last())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub start_year: i32,
    pub end_age: u32,
    #[serde(default)]
    pub reference_person: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub include_add_on_orders: bool,
    pub state_pension_defer_options: Vec<u32>,
    #[serde(default = "default_true")]
    pub maximize_couple_isa: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            include_add_on_orders: false,
            state_pension_defer_options: Vec::new(),
            maximize_couple_isa: true,
        }
    }
}

/// Growth-rate grid swept by the sensitivity analysis. Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    pub pension_growth_min: f64,
    pub pension_growth_max: f64,
    pub savings_growth_min: f64,
    pub savings_growth_max: f64,
    pub step_size: f64,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            pension_growth_min: 0.04,
            pension_growth_max: 0.12,
            savings_growth_min: 0.04,
            savings_growth_max: 0.12,
            step_size: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxConfig {
    pub taper_threshold: f64,
    pub taper_rate: f64,
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            taper_threshold: 100_000.0,
            taper_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub people: Vec<PersonConfig>,
    #[serde(default)]
    pub financial: FinancialConfig,
    #[serde(default)]
    pub income: IncomeConfig,
    #[serde(default)]
    pub mortgage: MortgageConfig,
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default = "uk_2024_bands")]
    pub tax_bands: Vec<TaxBand>,
    #[serde(default)]
    pub tax: TaxConfig,
    #[serde(default)]
    pub sensitivity: SensitivityConfig,
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_json(&raw)
}

fn check_amount(field: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(field, "must be a finite, non-negative amount"));
    }
    Ok(())
}

fn check_rate(field: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= -1.0 {
        return Err(ConfigError::invalid(field, "must be finite and greater than -100%"));
    }
    Ok(())
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.people.is_empty() {
            return Err(ConfigError::invalid("people", "at least one person is required"));
        }
        let mut names = BTreeSet::new();
        for (idx, person) in self.people.iter().enumerate() {
            let field = |name: &str| format!("people[{idx}].{name}");
            if person.name.trim().is_empty() {
                return Err(ConfigError::invalid(field("name"), "must not be empty"));
            }
            if !names.insert(person.name.as_str()) {
                return Err(ConfigError::invalid(
                    field("name"),
                    format!("duplicate person '{}'", person.name),
                ));
            }
            check_amount(&field("tax_free_savings"), person.tax_free_savings)?;
            check_amount(&field("pension"), person.pension)?;
            check_amount(&field("isa_annual_limit"), person.isa_annual_limit)?;
            check_amount(&field("work_income"), person.work_income)?;
            if let Some(db) = &person.db_pension {
                check_amount(&field("db_pension.annual_amount"), db.annual_amount)?;
                check_amount(&field("db_pension.early_factor"), db.early_factor)?;
                check_amount(&field("db_pension.late_factor"), db.late_factor)?;
                if !(0.0..=1.0).contains(&db.commutation) {
                    return Err(ConfigError::invalid(
                        field("db_pension.commutation"),
                        "must be between 0 and 1",
                    ));
                }
                if let Some(factor) = db.commute_factor {
                    check_amount(&field("db_pension.commute_factor"), factor)?;
                }
            }
            if let Some(work) = &person.part_time {
                check_amount(&field("part_time.annual_income"), work.annual_income)?;
                if work.start_age >= work.end_age {
                    return Err(ConfigError::invalid(
                        field("part_time"),
                        "start_age must be before end_age",
                    ));
                }
            }
        }

        for (field, name) in [
            ("simulation.reference_person", &self.simulation.reference_person),
            ("income.reference_person", &self.income.reference_person),
        ] {
            if !name.is_empty() && self.find_person(name).is_none() {
                return Err(ConfigError::invalid(field, format!("unknown person '{name}'")));
            }
        }
        if let Some(glide) = &self.financial.glide_path {
            if let Some(name) = &glide.reference_person {
                if self.find_person(name).is_none() {
                    return Err(ConfigError::invalid(
                        "financial.glide_path.reference_person",
                        format!("unknown person '{name}'"),
                    ));
                }
            }
            check_rate("financial.glide_path.pension_end_rate", glide.pension_end_rate)?;
            check_rate("financial.glide_path.savings_end_rate", glide.savings_end_rate)?;
        }

        let financial = &self.financial;
        check_rate("financial.pension_growth_rate", financial.pension_growth_rate)?;
        check_rate("financial.savings_growth_rate", financial.savings_growth_rate)?;
        check_rate("financial.income_inflation_rate", financial.income_inflation_rate)?;
        check_rate("financial.state_pension_inflation", financial.state_pension_inflation)?;
        check_rate("financial.tax_band_inflation", financial.tax_band_inflation)?;
        check_amount("financial.state_pension_amount", financial.state_pension_amount)?;
        check_amount("financial.state_pension_deferral_rate", financial.state_pension_deferral_rate)?;

        self.validate_tax_bands()?;
        check_amount("tax.taper_threshold", self.tax.taper_threshold)?;
        check_amount("tax.taper_rate", self.tax.taper_rate)?;

        for (idx, tier) in self.income.tiers.iter().enumerate() {
            if let (Some(start), Some(end)) = (tier.start_age, tier.end_age) {
                if start >= end {
                    return Err(ConfigError::invalid(
                        format!("income.tiers[{idx}]"),
                        "start_age must be before end_age",
                    ));
                }
            }
            match tier.kind {
                TierKind::Fixed { monthly } => {
                    check_amount(&format!("income.tiers[{idx}].monthly"), monthly)?
                }
                TierKind::Percentage { annual_percent } => {
                    check_amount(&format!("income.tiers[{idx}].annual_percent"), annual_percent)?
                }
                TierKind::InvestmentGains => {}
            }
            if let Some(ratio) = tier.ratio {
                check_amount(&format!("income.tiers[{idx}].ratio"), ratio)?;
            }
        }
        let rails = &self.income.guardrails;
        if rails.lower_limit <= 0.0 || rails.upper_limit <= rails.lower_limit {
            return Err(ConfigError::invalid(
                "income.guardrails",
                "limits must satisfy 0 < lower_limit < upper_limit",
            ));
        }
        if !(0.0..1.0).contains(&rails.adjustment) {
            return Err(ConfigError::invalid(
                "income.guardrails.adjustment",
                "must be between 0 and 1",
            ));
        }
        check_amount("income.vpw.floor", self.income.vpw.floor)?;
        check_amount("income.vpw.ceiling_multiple", self.income.vpw.ceiling_multiple)?;

        for (idx, part) in self.mortgage.parts.iter().enumerate() {
            let field = |name: &str| format!("mortgage.parts[{idx}].{name}");
            check_amount(&field("principal"), part.principal)?;
            check_amount(&field("interest_rate"), part.interest_rate)?;
            if part.is_repayment && part.term_years == 0 {
                return Err(ConfigError::invalid(
                    field("term_years"),
                    "repayment mortgages need a term of at least one year",
                ));
            }
        }
        if self.mortgage.has_mortgage() {
            let start_year = self.simulation.start_year;
            if self.mortgage.end_year < start_year {
                return Err(ConfigError::invalid(
                    "mortgage.end_year",
                    format!("must not be before simulation.start_year ({start_year})"),
                ));
            }
            // Early and PCLS payoff both pay off in this year, so it must be inside the term.
            if self.mortgage.early_payoff_year < start_year {
                return Err(ConfigError::invalid(
                    "mortgage.early_payoff_year",
                    format!("must not be before simulation.start_year ({start_year})"),
                ));
            }
            if self.mortgage.early_payoff_year > self.mortgage.end_year {
                return Err(ConfigError::invalid(
                    "mortgage.early_payoff_year",
                    "must not be after end_year",
                ));
            }
        }

        let sens = &self.sensitivity;
        for (field, min, max) in [
            ("sensitivity.pension_growth", sens.pension_growth_min, sens.pension_growth_max),
            ("sensitivity.savings_growth", sens.savings_growth_min, sens.savings_growth_max),
        ] {
            check_rate(&format!("{field}_min"), min)?;
            check_rate(&format!("{field}_max"), max)?;
            if max < min {
                return Err(ConfigError::invalid(field, "max must not be below min"));
            }
        }
        if !sens.step_size.is_finite() || sens.step_size <= 0.0 {
            return Err(ConfigError::invalid("sensitivity.step_size", "must be greater than zero"));
        }

        if self.end_year() < self.simulation.start_year {
            return Err(ConfigError::invalid(
                "simulation.end_age",
                "horizon ends before the start year",
            ));
        }
        Ok(())
    }

    fn validate_tax_bands(&self) -> Result<(), ConfigError> {
        let bands = &self.tax_bands;
        let Some(first) = bands.first() else {
            return Err(ConfigError::invalid("tax_bands", "at least one band is required"));
        };
        if first.lower != 0.0 {
            return Err(ConfigError::invalid("tax_bands[0].lower", "first band must start at 0"));
        }
        for (idx, band) in bands.iter().enumerate() {
            if !(0.0..1.0).contains(&band.rate) {
                return Err(ConfigError::invalid(
                    format!("tax_bands[{idx}].rate"),
                    "must be in [0, 1)",
                ));
            }
            if band.upper <= band.lower {
                return Err(ConfigError::invalid(
                    format!("tax_bands[{idx}]"),
                    "upper must be greater than lower",
                ));
            }
            if let Some(next) = bands.get(idx + 1) {
                if !band.upper.is_finite() {
                    return Err(ConfigError::invalid(
                        format!("tax_bands[{idx}].upper"),
                        "only the last band may be unbounded",
                    ));
                }
                if (next.lower - band.upper).abs() > 1e-9 {
                    return Err(ConfigError::invalid(
                        format!("tax_bands[{}].lower", idx + 1),
                        "bands must be contiguous",
                    ));
                }
                if next.rate < band.rate {
                    return Err(ConfigError::invalid(
                        format!("tax_bands[{}].rate", idx + 1),
                        "rates must not decrease",
                    ));
                }
            } else if band.upper.is_finite() {
                return Err(ConfigError::invalid(
                    format!("tax_bands[{idx}].upper"),
                    "last band must be unbounded",
                ));
            }
        }
        Ok(())
    }

    pub fn find_person(&self, name: &str) -> Option<&PersonConfig> {
        self.people.iter().find(|person| person.name == name)
    }

    fn person_or_first(&self, name: &str) -> &PersonConfig {
        self.find_person(name).unwrap_or(&self.people[0])
    }

    pub fn simulation_reference(&self) -> &PersonConfig {
        self.person_or_first(&self.simulation.reference_person)
    }

    /// Person whose age selects income tiers and triggers the need for income.
    pub fn income_reference(&self) -> &PersonConfig {
        if self.income.reference_person.is_empty() {
            return self.simulation_reference();
        }
        self.person_or_first(&self.income.reference_person)
    }

    pub fn end_year(&self) -> i32 {
        self.simulation_reference().birth_year() + self.simulation.end_age as i32
    }

    pub fn tax_schedule(&self) -> TaxSchedule {
        TaxSchedule {
            bands: self.tax_bands.clone(),
            taper_threshold: self.tax.taper_threshold,
            taper_rate: self.tax.taper_rate,
        }
    }

    pub fn initial_portfolio(&self) -> f64 {
        self.people
            .iter()
            .map(|person| person.tax_free_savings + person.pension)
            .sum()
    }

    pub fn has_mortgage(&self) -> bool {
        self.mortgage.has_mortgage()
    }

    /// Fresh, independently owned household for one simulation run.
    pub fn build_people(&self) -> Vec<Person> {
        self.people
            .iter()
            .map(|cfg| Person {
                name: cfg.name.clone(),
                birth_year: cfg.birth_year(),
                pension_access_age: cfg.pension_access_age,
                retirement_age: cfg.retirement_age(),
                state_pension_age: cfg.state_pension_age,
                tax_free_savings: cfg.tax_free_savings,
                uncrystallised_pot: cfg.pension,
                crystallised_pot: 0.0,
                pcls_taken: false,
                isa_annual_limit: cfg.isa_annual_limit,
                db_pension: cfg.db_pension.as_ref().map(|db| DbPension {
                    annual_amount: db.annual_amount,
                    start_age: db.start_age,
                    normal_age: db.normal_age.unwrap_or(db.start_age),
                    early_factor: db.early_factor,
                    late_factor: db.late_factor,
                    commutation: db.commutation,
                    commute_factor: db.commute_factor.unwrap_or(12.0),
                }),
                db_lump_sum_taken: false,
                state_pension_defer_years: cfg.state_pension_defer_years,
                state_pension_deferral_rate: self.financial.state_pension_deferral_rate,
                emergency_fund_minimum: 0.0,
                work_income: cfg.work_income,
                part_time: cfg.part_time.map(|work| PartTimeWork {
                    annual_income: work.annual_income,
                    start_age: work.start_age,
                    end_age: work.end_age,
                }),
            })
            .collect()
    }
}
