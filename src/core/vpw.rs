use serde::{Deserialize, Serialize};

const FIRST_AGE: u32 = 55;
const LAST_AGE: u32 = 100;

/// Fraction of the portfolio to draw at each age from 55 to 100.
const VPW_TABLE: [f64; 46] = [
    0.030, 0.031, 0.032, 0.033, 0.034, 0.035, 0.036, 0.037, 0.039, 0.040, // 55-64
    0.042, 0.043, 0.045, 0.047, 0.048, 0.050, 0.052, 0.054, 0.056, 0.058, // 65-74
    0.061, 0.064, 0.067, 0.070, 0.073, 0.077, 0.081, 0.085, 0.089, 0.094, // 75-84
    0.100, 0.106, 0.113, 0.120, 0.128, 0.137, 0.147, 0.159, 0.172, 0.187, // 85-94
    0.204, 0.224, 0.247, 0.274, 0.307, 0.350, // 95-100
];

pub fn vpw_rate(age: u32) -> f64 {
    let age = age.clamp(FIRST_AGE, LAST_AGE);
    VPW_TABLE[(age - FIRST_AGE) as usize]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpwConfig {
    pub enabled: bool,
    /// Minimum annual withdrawal in today's money; 0 disables the floor.
    pub floor: f64,
    /// Maximum withdrawal as a multiple of the inflated floor; 0 disables the ceiling.
    pub ceiling_multiple: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VpwSuggestion {
    pub rate: f64,
    pub income: f64,
}

impl VpwConfig {
    /// Annual income suggested for `age`, clamped between the inflated floor and ceiling.
    pub fn suggest(&self, portfolio_value: f64, age: u32, inflation_multiplier: f64) -> VpwSuggestion {
        let rate = vpw_rate(age);
        let mut income = portfolio_value.max(0.0) * rate;
        if self.floor > 0.0 {
            let floor = self.floor * inflation_multiplier;
            income = income.max(floor);
            if self.ceiling_multiple > 0.0 {
                income = income.min(floor * self.ceiling_multiple);
            }
        }
        VpwSuggestion { rate, income }
    }
}
