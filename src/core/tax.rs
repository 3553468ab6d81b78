use serde::{Deserialize, Serialize};

/// One slice of the progressive schedule. The last band is unbounded (`upper == f64::INFINITY`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaxBand {
    pub lower: f64,
    #[serde(with = "upper_bound", default = "unbounded")]
    pub upper: f64,
    pub rate: f64,
}

fn unbounded() -> f64 {
    f64::INFINITY
}

/// JSON has no infinity, so an unbounded upper edge travels as `null` or is omitted.
mod upper_bound {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

impl TaxBand {
    pub const fn new(lower: f64, upper: f64, rate: f64) -> Self {
        Self { lower, upper, rate }
    }

    fn is_allowance(&self) -> bool {
        self.lower == 0.0 && self.rate == 0.0
    }
}

pub fn uk_2024_bands() -> Vec<TaxBand> {
    vec![
        TaxBand::new(0.0, 12_570.0, 0.0),
        TaxBand::new(12_570.0, 50_270.0, 0.20),
        TaxBand::new(50_270.0, 125_140.0, 0.40),
        TaxBand::new(125_140.0, f64::INFINITY, 0.45),
    ]
}

/// Bands plus the personal-allowance taper rule for one tax year.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxSchedule {
    pub bands: Vec<TaxBand>,
    pub taper_threshold: f64,
    pub taper_rate: f64,
}

impl Default for TaxSchedule {
    fn default() -> Self {
        Self {
            bands: uk_2024_bands(),
            taper_threshold: 100_000.0,
            taper_rate: 0.5,
        }
    }
}

impl TaxSchedule {
    /// Untapered allowance: the upper edge of the zero-rate band starting at 0.
    pub fn personal_allowance(&self) -> f64 {
        self.bands
            .iter()
            .find(|band| band.is_allowance())
            .map_or(0.0, |band| band.upper)
    }

    /// Upper edge of the first taxed band.
    pub fn basic_rate_limit(&self) -> f64 {
        self.bands
            .iter()
            .find(|band| band.rate > 0.0)
            .map_or(f64::INFINITY, |band| band.upper)
    }

    pub fn basic_rate(&self) -> f64 {
        self.bands
            .iter()
            .find(|band| band.rate > 0.0)
            .map_or(0.0, |band| band.rate)
    }

    pub fn tapered_allowance(&self, income: f64) -> f64 {
        let allowance = self.personal_allowance();
        if income <= self.taper_threshold {
            return allowance;
        }
        (allowance - (income - self.taper_threshold) * self.taper_rate).max(0.0)
    }

    /// Bands with the allowance band shrunk for `income` and the next band widened to meet it.
    pub fn tapered_bands(&self, income: f64) -> Vec<TaxBand> {
        let mut bands = self.bands.clone();
        if income <= self.taper_threshold {
            return bands;
        }
        let reduced = self.tapered_allowance(income);
        if let Some(idx) = bands.iter().position(TaxBand::is_allowance) {
            bands[idx].upper = reduced;
            if let Some(next) = bands.get_mut(idx + 1) {
                next.lower = reduced;
            }
        }
        bands
    }

    /// Allowance still unused by `existing_income`.
    pub fn allowance_space(&self, existing_income: f64) -> f64 {
        (self.personal_allowance() - existing_income.max(0.0)).max(0.0)
    }

    /// Income that can be added above `existing_income` before leaving the basic band.
    pub fn basic_band_space(&self, existing_income: f64) -> f64 {
        let limit = self.basic_rate_limit();
        if !limit.is_finite() {
            return f64::INFINITY;
        }
        let floor = existing_income.max(self.personal_allowance());
        (limit - floor).max(0.0)
    }

    pub fn inflated(&self, from_year: i32, to_year: i32, rate: f64) -> Self {
        Self {
            bands: inflate_tax_bands(&self.bands, from_year, to_year, rate),
            ..self.clone()
        }
    }
}

pub fn calculate_tax(income: f64, bands: &[TaxBand]) -> f64 {
    if income <= 0.0 {
        return 0.0;
    }
    let mut tax = 0.0;
    for band in bands {
        if income <= band.lower {
            break;
        }
        let in_band = income.min(band.upper) - band.lower;
        if in_band > 0.0 {
            tax += in_band * band.rate;
        }
    }
    tax
}

pub fn calculate_tax_with_tapering(income: f64, schedule: &TaxSchedule) -> f64 {
    if income <= 0.0 {
        return 0.0;
    }
    calculate_tax(income, &schedule.tapered_bands(income))
}

/// Tax attributable to `withdrawal` stacked on top of `existing_income`.
pub fn calculate_marginal_tax(withdrawal: f64, existing_income: f64, schedule: &TaxSchedule) -> f64 {
    if withdrawal <= 0.0 {
        return 0.0;
    }
    let with = calculate_tax_with_tapering(existing_income + withdrawal, schedule);
    let without = calculate_tax_with_tapering(existing_income, schedule);
    (with - without).max(0.0)
}

/// Finds the gross withdrawal whose post-tax value is `net_needed`. Returns `(gross, tax)`.
pub fn gross_up_for_tax(net_needed: f64, existing_income: f64, schedule: &TaxSchedule) -> (f64, f64) {
    if net_needed <= 0.0 {
        return (0.0, 0.0);
    }
    let net_of = |gross: f64| gross - calculate_marginal_tax(gross, existing_income, schedule);

    let mut low = net_needed;
    let mut high = net_needed * 2.5;
    let mut widenings = 0;
    while net_of(high) < net_needed && widenings < 64 {
        low = high;
        high *= 2.0;
        widenings += 1;
    }

    for _ in 0..100 {
        let mid = (low + high) * 0.5;
        let tax = calculate_marginal_tax(mid, existing_income, schedule);
        let net = mid - tax;
        if (net - net_needed).abs() < 0.01 {
            return (mid, tax);
        }
        if net < net_needed {
            low = mid;
        } else {
            high = mid;
        }
    }
    (high, calculate_marginal_tax(high, existing_income, schedule))
}

pub fn inflate_tax_bands(bands: &[TaxBand], from_year: i32, to_year: i32, rate: f64) -> Vec<TaxBand> {
    if rate == 0.0 || to_year <= from_year {
        return bands.to_vec();
    }
    let multiplier = (1.0 + rate).powi(to_year - from_year);
    bands
        .iter()
        .map(|band| TaxBand {
            lower: band.lower * multiplier,
            upper: band.upper * multiplier,
            rate: band.rate,
        })
        .collect()
}

/// Effective rate on the next pound above `income`, taper included.
pub fn marginal_rate(income: f64, schedule: &TaxSchedule) -> f64 {
    let income = income.max(0.0);
    calculate_tax_with_tapering(income + 1.0, schedule) - calculate_tax_with_tapering(income, schedule)
}
