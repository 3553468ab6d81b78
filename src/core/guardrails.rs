use serde::{Deserialize, Serialize};

use super::types::GuardrailDirection;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    /// Cut spending when the current rate exceeds this multiple of the initial rate.
    pub upper_limit: f64,
    /// Raise spending when the current rate falls below this multiple.
    pub lower_limit: f64,
    pub adjustment: f64,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            upper_limit: 1.20,
            lower_limit: 0.80,
            adjustment: 0.10,
        }
    }
}

/// Guyton-Klinger state carried from one simulated year to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardrailsState {
    config: GuardrailsConfig,
    initial_rate: Option<f64>,
    current_withdrawal: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardrailsOutcome {
    pub withdrawal: f64,
    pub direction: GuardrailDirection,
}

impl GuardrailsState {
    pub fn new(config: GuardrailsConfig) -> Self {
        Self {
            config,
            initial_rate: None,
            current_withdrawal: 0.0,
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.initial_rate.is_some()
    }

    pub fn initial_rate(&self) -> Option<f64> {
        self.initial_rate
    }

    /// Withdrawal for this year. The first call fixes the initial withdrawal rate and returns
    /// `base_withdrawal` unchanged; later calls inflate last year's withdrawal and apply the rails.
    pub fn adjust(&mut self, portfolio_value: f64, base_withdrawal: f64, inflation: f64) -> GuardrailsOutcome {
        let Some(initial_rate) = self.initial_rate else {
            if portfolio_value > 0.0 && base_withdrawal > 0.0 {
                self.initial_rate = Some(base_withdrawal / portfolio_value);
                self.current_withdrawal = base_withdrawal;
            }
            return GuardrailsOutcome {
                withdrawal: base_withdrawal,
                direction: GuardrailDirection::Unchanged,
            };
        };

        let mut withdrawal = self.current_withdrawal * (1.0 + inflation);
        let mut direction = GuardrailDirection::Unchanged;
        if portfolio_value > 0.0 {
            let ratio = (withdrawal / portfolio_value) / initial_rate;
            if ratio > self.config.upper_limit {
                withdrawal *= 1.0 - self.config.adjustment;
                direction = GuardrailDirection::Reduced;
            } else if ratio < self.config.lower_limit {
                withdrawal *= 1.0 + self.config.adjustment;
                direction = GuardrailDirection::Increased;
            }
        }
        self.current_withdrawal = withdrawal;
        GuardrailsOutcome {
            withdrawal,
            direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn first_year_sets_initial_rate() {
        let mut state = GuardrailsState::new(GuardrailsConfig::default());
        let outcome = state.adjust(1_000_000.0, 40_000.0, 0.02);
        assert_approx(outcome.withdrawal, 40_000.0);
        assert_eq!(outcome.direction, GuardrailDirection::Unchanged);
        assert_approx(state.initial_rate().unwrap_or_default(), 0.04);
    }

    #[test]
    fn steady_portfolio_only_inflates() {
        let mut state = GuardrailsState::new(GuardrailsConfig::default());
        state.adjust(1_000_000.0, 40_000.0, 0.02);
        let outcome = state.adjust(1_000_000.0, 99_999.0, 0.02);
        assert_approx(outcome.withdrawal, 40_800.0);
        assert_eq!(outcome.direction, GuardrailDirection::Unchanged);
    }

    #[test]
    fn falling_portfolio_triggers_capital_preservation() {
        let mut state = GuardrailsState::new(GuardrailsConfig::default());
        state.adjust(1_000_000.0, 40_000.0, 0.0);
        let outcome = state.adjust(700_000.0, 40_000.0, 0.0);
        assert_eq!(outcome.direction, GuardrailDirection::Reduced);
        assert_approx(outcome.withdrawal, 36_000.0);
    }

    #[test]
    fn rising_portfolio_triggers_prosperity_rule() {
        let mut state = GuardrailsState::new(GuardrailsConfig::default());
        state.adjust(1_000_000.0, 40_000.0, 0.0);
        let outcome = state.adjust(1_400_000.0, 40_000.0, 0.0);
        assert_eq!(outcome.direction, GuardrailDirection::Increased);
        assert_approx(outcome.withdrawal, 44_000.0);
    }

    #[test]
    fn empty_portfolio_does_not_initialise() {
        let mut state = GuardrailsState::new(GuardrailsConfig::default());
        let outcome = state.adjust(0.0, 30_000.0, 0.02);
        assert_approx(outcome.withdrawal, 30_000.0);
        assert!(!state.is_initialised());
    }
}
