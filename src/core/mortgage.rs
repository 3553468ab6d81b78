use serde::{Deserialize, Serialize};

use super::types::MortgageOption;

/// Extra years granted by [`MortgageOption::Extended`].
pub const EXTENSION_YEARS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MortgagePartConfig {
    pub name: String,
    pub principal: f64,
    pub interest_rate: f64,
    pub term_years: u32,
    pub start_year: i32,
    pub is_repayment: bool,
}

impl Default for MortgagePartConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            principal: 0.0,
            interest_rate: 0.0,
            term_years: 25,
            start_year: 0,
            is_repayment: true,
        }
    }
}

impl MortgagePartConfig {
    fn monthly_rate(&self) -> f64 {
        self.interest_rate / 12.0
    }

    fn payment_count(&self) -> f64 {
        (self.term_years * 12) as f64
    }

    pub fn end_year(&self) -> i32 {
        self.start_year + self.term_years as i32
    }

    pub fn monthly_payment(&self) -> f64 {
        if self.principal <= 0.0 {
            return 0.0;
        }
        if !self.is_repayment || self.term_years == 0 {
            return self.principal * self.monthly_rate();
        }
        let r = self.monthly_rate();
        let n = self.payment_count();
        if r == 0.0 {
            return self.principal / n;
        }
        let factor = (1.0 + r).powf(n);
        self.principal * r * factor / (factor - 1.0)
    }

    pub fn annual_payment(&self) -> f64 {
        self.monthly_payment() * 12.0
    }

    /// Outstanding principal at the start of `year`.
    pub fn remaining_balance(&self, year: i32) -> f64 {
        if self.principal <= 0.0 {
            return 0.0;
        }
        if !self.is_repayment {
            return self.principal;
        }
        let elapsed = year - self.start_year;
        if elapsed <= 0 {
            return self.principal;
        }
        if year >= self.end_year() {
            return 0.0;
        }
        let r = self.monthly_rate();
        let n = self.payment_count();
        let p = (elapsed * 12) as f64;
        if r == 0.0 {
            return self.principal * (1.0 - p / n);
        }
        let factor_n = (1.0 + r).powf(n);
        let factor_p = (1.0 + r).powf(p);
        self.principal * (factor_n - factor_p) / (factor_n - 1.0)
    }

    pub fn is_active(&self, year: i32) -> bool {
        if self.principal <= 0.0 || year < self.start_year {
            return false;
        }
        !self.is_repayment || year < self.end_year()
    }

    /// Same loan re-amortised over a longer term. Interest-only parts are unchanged.
    pub fn extended(&self, extra_years: u32) -> Self {
        let mut part = self.clone();
        if part.is_repayment {
            part.term_years += extra_years;
        }
        part
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MortgageConfig {
    pub parts: Vec<MortgagePartConfig>,
    pub end_year: i32,
    pub early_payoff_year: i32,
}

impl MortgageConfig {
    pub fn has_mortgage(&self) -> bool {
        self.parts.iter().any(|part| part.principal > 0.0)
    }

    pub fn payoff_year(&self, option: MortgageOption) -> i32 {
        match option {
            MortgageOption::Early | MortgageOption::PclsPayoff => self.early_payoff_year,
            MortgageOption::Normal => self.end_year,
            MortgageOption::Extended => self.end_year + EXTENSION_YEARS as i32,
        }
    }

    /// Parts as they are repaid under `option`.
    pub fn parts_for(&self, option: MortgageOption) -> Vec<MortgagePartConfig> {
        match option {
            MortgageOption::Extended => self
                .parts
                .iter()
                .map(|part| part.extended(EXTENSION_YEARS))
                .collect(),
            _ => self.parts.clone(),
        }
    }

    /// Regular repayments due in `year`; zero from the payoff year on.
    pub fn annual_cost(&self, year: i32, option: MortgageOption) -> f64 {
        if !self.has_mortgage() || year >= self.payoff_year(option) {
            return 0.0;
        }
        self.parts_for(option)
            .iter()
            .filter(|part| part.is_active(year))
            .map(MortgagePartConfig::annual_payment)
            .sum()
    }

    /// Lump sum that clears every part in the payoff year, zero otherwise.
    pub fn payoff_amount(&self, year: i32, option: MortgageOption) -> f64 {
        if !self.has_mortgage() || year != self.payoff_year(option) {
            return 0.0;
        }
        self.parts_for(option)
            .iter()
            .map(|part| part.remaining_balance(year))
            .sum()
    }

    pub fn cost_for_year(&self, year: i32, option: MortgageOption) -> f64 {
        self.annual_cost(year, option) + self.payoff_amount(year, option)
    }
}
