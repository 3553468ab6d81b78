use super::types::Person;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthRates {
    pub pension: f64,
    pub savings: f64,
}

/// Linear decline of both rates from the simulation start to a target year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlidePath {
    pub pension_end_rate: f64,
    pub savings_end_rate: f64,
    pub start_year: i32,
    pub target_year: i32,
}

impl GrowthRates {
    pub fn for_year(base: GrowthRates, glide: Option<&GlidePath>, year: i32) -> Self {
        match glide {
            None => base,
            Some(path) => GrowthRates {
                pension: glide_rate(
                    base.pension,
                    path.pension_end_rate,
                    path.start_year,
                    path.target_year,
                    year,
                ),
                savings: glide_rate(
                    base.savings,
                    path.savings_end_rate,
                    path.start_year,
                    path.target_year,
                    year,
                ),
            },
        }
    }
}

pub fn glide_rate(start_rate: f64, end_rate: f64, start_year: i32, target_year: i32, year: i32) -> f64 {
    let span = target_year - start_year;
    if span <= 0 {
        return end_rate;
    }
    let progress = ((year - start_year) as f64 / span as f64).clamp(0.0, 1.0);
    start_rate + (end_rate - start_rate) * progress
}

pub fn grow(balance: f64, rate: f64) -> f64 {
    balance * (1.0 + rate)
}

pub fn apply_growth(person: &mut Person, rates: GrowthRates) {
    person.uncrystallised_pot = grow(person.uncrystallised_pot, rates.pension);
    person.crystallised_pot = grow(person.crystallised_pot, rates.pension);
    person.tax_free_savings = grow(person.tax_free_savings, rates.savings);
}
