//! Moving money out of pension and ISA pots.
//!
//! Every amount taken from the uncrystallised pot is split 25% tax-free / 75% taxable,
//! except gradual crystallisation after the lump sum has already been taken.

use super::types::{CrystallisationStrategy, Person};

pub const TAX_FREE_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrystallisationResult {
    pub amount_crystallised: f64,
    pub tax_free_portion: f64,
    pub taxable_portion: f64,
}

/// Crystallises the whole uncrystallised pot at once: 25% lands in the ISA, 75% in the crystallised pot.
pub fn take_pcls_lump_sum(person: &mut Person) -> CrystallisationResult {
    if person.uncrystallised_pot <= 0.0 || person.pcls_taken {
        return CrystallisationResult::default();
    }
    let amount = person.uncrystallised_pot;
    let tax_free = amount * TAX_FREE_FRACTION;
    let taxable = amount - tax_free;

    person.tax_free_savings += tax_free;
    person.crystallised_pot += taxable;
    person.uncrystallised_pot = 0.0;
    person.pcls_taken = true;

    CrystallisationResult {
        amount_crystallised: amount,
        tax_free_portion: tax_free,
        taxable_portion: taxable,
    }
}

/// Moves up to `amount` into the crystallised pot, paying out the tax-free share as cash.
pub fn gradual_crystallise(person: &mut Person, amount: f64) -> CrystallisationResult {
    if amount <= 0.0 || person.uncrystallised_pot <= 0.0 {
        return CrystallisationResult::default();
    }
    let crystallised = amount.min(person.uncrystallised_pot);
    let tax_free = if person.pcls_taken {
        0.0
    } else {
        crystallised * TAX_FREE_FRACTION
    };
    let taxable = crystallised - tax_free;

    person.uncrystallised_pot -= crystallised;
    person.crystallised_pot += taxable;

    CrystallisationResult {
        amount_crystallised: crystallised,
        tax_free_portion: tax_free,
        taxable_portion: taxable,
    }
}

/// Pays up to `amount` straight out of the uncrystallised pot with the split applied per payment.
pub fn ufpls_withdraw(person: &mut Person, amount: f64) -> CrystallisationResult {
    if amount <= 0.0 || person.uncrystallised_pot <= 0.0 {
        return CrystallisationResult::default();
    }
    let withdrawn = amount.min(person.uncrystallised_pot);
    let tax_free = withdrawn * TAX_FREE_FRACTION;

    person.uncrystallised_pot -= withdrawn;

    CrystallisationResult {
        amount_crystallised: withdrawn,
        tax_free_portion: tax_free,
        taxable_portion: withdrawn - tax_free,
    }
}

/// Never dips into the emergency fund.
pub fn withdraw_from_isa(person: &mut Person, amount: f64) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    let withdrawal = amount.min(person.available_isa());
    if withdrawal <= 0.0 {
        return 0.0;
    }
    person.tax_free_savings -= withdrawal;
    withdrawal
}

pub fn withdraw_from_crystallised(person: &mut Person, amount: f64) -> f64 {
    if amount <= 0.0 || person.crystallised_pot <= 0.0 {
        return 0.0;
    }
    let withdrawal = amount.min(person.crystallised_pot);
    person.crystallised_pot -= withdrawal;
    withdrawal
}

/// Share of an uncrystallised withdrawal that arrives tax-free under `strategy`.
pub fn tax_free_fraction(person: &Person, strategy: CrystallisationStrategy) -> f64 {
    match strategy {
        CrystallisationStrategy::Gradual if person.pcls_taken => 0.0,
        _ => TAX_FREE_FRACTION,
    }
}

/// Takes `amount` out of the uncrystallised pot as cash. Under gradual crystallisation the
/// taxable share passes through the crystallised pot and is drawn in the same step.
pub fn draw_uncrystallised(
    person: &mut Person,
    amount: f64,
    strategy: CrystallisationStrategy,
) -> CrystallisationResult {
    match strategy {
        CrystallisationStrategy::Gradual => {
            let result = gradual_crystallise(person, amount);
            let drawn = withdraw_from_crystallised(person, result.taxable_portion);
            CrystallisationResult {
                taxable_portion: drawn,
                ..result
            }
        }
        CrystallisationStrategy::Ufpls => ufpls_withdraw(person, amount),
    }
}
