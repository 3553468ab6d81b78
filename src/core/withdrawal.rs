use std::collections::BTreeMap;

use super::crystallisation::{
    draw_uncrystallised, tax_free_fraction, withdraw_from_crystallised, withdraw_from_isa,
};
use super::tax::{TaxSchedule, calculate_marginal_tax, gross_up_for_tax};
use super::types::{CrystallisationStrategy, DrawdownOrder, Person, WithdrawalBreakdown};

const PENNY: f64 = 0.01;

/// Everything a drawdown policy may look at besides the pots themselves.
#[derive(Debug, Clone, Copy)]
pub struct DrawdownContext<'a> {
    pub year: i32,
    pub crystallisation: CrystallisationStrategy,
    pub order: DrawdownOrder,
    pub maximize_couple_isa: bool,
    pub schedule: &'a TaxSchedule,
    /// Taxable guaranteed income (state, DB, work) per person.
    pub guaranteed_taxable: &'a BTreeMap<String, f64>,
    pub state_pension: &'a BTreeMap<String, f64>,
    /// Income reference person has reached retirement age.
    pub retired: bool,
}

impl DrawdownContext<'_> {
    fn guaranteed_for(&self, name: &str) -> f64 {
        self.guaranteed_taxable.get(name).copied().unwrap_or(0.0)
    }

    fn existing_taxable(&self, name: &str, breakdown: &WithdrawalBreakdown) -> f64 {
        self.guaranteed_for(name) + breakdown.taxable_for(name)
    }

    fn anyone_on_state_pension(&self) -> bool {
        self.state_pension.values().any(|amount| *amount > 0.0)
    }
}

/// Draws `net_needed` (after tax) from the household's pots under `ctx.order`.
pub fn execute_drawdown(
    people: &mut [Person],
    net_needed: f64,
    ctx: &DrawdownContext<'_>,
) -> WithdrawalBreakdown {
    let mut breakdown = WithdrawalBreakdown::default();
    let net_needed = net_needed.max(0.0);

    match ctx.order {
        DrawdownOrder::SavingsFirst => {
            let remaining = withdraw_from_isas(people, net_needed, &mut breakdown);
            withdraw_from_pensions(people, remaining, ctx, &mut breakdown);
        }
        DrawdownOrder::PensionFirst => {
            let remaining = withdraw_from_pensions(people, net_needed, ctx, &mut breakdown);
            withdraw_from_isas(people, remaining, &mut breakdown);
        }
        DrawdownOrder::PensionOnly => {
            let remaining = withdraw_from_pensions(people, net_needed, ctx, &mut breakdown);
            let pension_left = people
                .iter()
                .any(|p| p.can_access_pension(ctx.year) && p.total_pension() > PENNY);
            if remaining > PENNY && !pension_left {
                withdraw_from_isas(people, remaining, &mut breakdown);
            }
        }
        DrawdownOrder::TaxOptimized => tax_optimized(people, net_needed, ctx, &mut breakdown),
        DrawdownOrder::PensionToIsa => {
            if net_needed > 0.0 {
                fill_bands_to_isa(people, net_needed, ctx, DepositSplit::Equal, &mut breakdown);
            }
        }
        DrawdownOrder::PensionToIsaProactive => {
            if net_needed > 0.0 || !ctx.retired {
                fill_bands_to_isa(people, net_needed, ctx, DepositSplit::Equal, &mut breakdown);
            }
        }
        DrawdownOrder::FillBasicRate => {
            if net_needed > 0.0 || ctx.retired {
                fill_bands_to_isa(people, net_needed, ctx, DepositSplit::Sequential, &mut breakdown);
            }
        }
        DrawdownOrder::StatePensionBridge => {
            if net_needed <= 0.0 {
                return breakdown;
            }
            if ctx.anyone_on_state_pension() {
                let remaining = withdraw_from_pensions(people, net_needed, ctx, &mut breakdown);
                withdraw_from_isas(people, remaining, &mut breakdown);
            } else {
                fill_bands_to_isa(people, net_needed, ctx, DepositSplit::Sequential, &mut breakdown);
            }
        }
    }

    breakdown
}

/// Pulls `remaining` from ISAs in proportion to what each person can spare. Returns what is still owed.
fn withdraw_from_isas(people: &mut [Person], remaining: f64, breakdown: &mut WithdrawalBreakdown) -> f64 {
    if remaining <= 0.0 {
        return 0.0;
    }
    let total_available: f64 = people.iter().map(Person::available_isa).sum();
    if total_available <= 0.0 {
        return remaining;
    }
    let to_take = remaining.min(total_available);
    let mut still_owed = remaining;
    for person in people.iter_mut() {
        let available = person.available_isa();
        if available <= 0.0 {
            continue;
        }
        let share = to_take * available / total_available;
        let actual = withdraw_from_isa(person, share);
        breakdown.record_isa(&person.name, actual);
        still_owed -= actual;
    }
    still_owed.max(0.0)
}

/// Cash (net of tax) one person gets from drawing `amount` out of the uncrystallised pot.
fn net_from_uncrystallised(
    person: &Person,
    amount: f64,
    existing_taxable: f64,
    ctx: &DrawdownContext<'_>,
) -> f64 {
    let taxable = amount * (1.0 - tax_free_fraction(person, ctx.crystallisation));
    amount - calculate_marginal_tax(taxable, existing_taxable, ctx.schedule)
}

/// Draws from one person's pension until `net_target` cash is raised or the pots run dry.
/// Returns the net cash raised.
fn draw_pension_for_net(
    person: &mut Person,
    net_target: f64,
    ctx: &DrawdownContext<'_>,
    breakdown: &mut WithdrawalBreakdown,
) -> f64 {
    if net_target <= PENNY || !person.can_access_pension(ctx.year) {
        return 0.0;
    }
    let mut raised = 0.0;
    let uncrystallised_first = ctx.crystallisation == CrystallisationStrategy::Ufpls;
    if uncrystallised_first {
        raised += draw_uncrystallised_for_net(person, net_target, ctx, breakdown);
        raised += draw_crystallised_for_net(person, net_target - raised, ctx, breakdown);
    } else {
        raised += draw_crystallised_for_net(person, net_target, ctx, breakdown);
        raised += draw_uncrystallised_for_net(person, net_target - raised, ctx, breakdown);
    }
    raised
}

fn draw_crystallised_for_net(
    person: &mut Person,
    net_target: f64,
    ctx: &DrawdownContext<'_>,
    breakdown: &mut WithdrawalBreakdown,
) -> f64 {
    if net_target <= PENNY || person.crystallised_pot <= 0.0 {
        return 0.0;
    }
    let existing = ctx.existing_taxable(&person.name, breakdown);
    let (gross, _) = gross_up_for_tax(net_target, existing, ctx.schedule);
    let actual = withdraw_from_crystallised(person, gross);
    breakdown.record_taxable(&person.name, actual);
    actual - calculate_marginal_tax(actual, existing, ctx.schedule)
}

fn draw_uncrystallised_for_net(
    person: &mut Person,
    net_target: f64,
    ctx: &DrawdownContext<'_>,
    breakdown: &mut WithdrawalBreakdown,
) -> f64 {
    if net_target <= PENNY || person.uncrystallised_pot <= 0.0 {
        return 0.0;
    }
    let existing = ctx.existing_taxable(&person.name, breakdown);
    let pot = person.uncrystallised_pot;

    let amount = if net_from_uncrystallised(person, pot, existing, ctx) <= net_target {
        pot
    } else {
        let (mut low, mut high) = (0.0, pot);
        let mut amount = pot;
        for _ in 0..100 {
            let mid = (low + high) * 0.5;
            let net = net_from_uncrystallised(person, mid, existing, ctx);
            if (net - net_target).abs() < PENNY {
                amount = mid;
                break;
            }
            if net < net_target {
                low = mid;
            } else {
                high = mid;
            }
            amount = high;
        }
        amount
    };

    let result = draw_uncrystallised(person, amount, ctx.crystallisation);
    breakdown.record_tax_free_pension(&person.name, result.tax_free_portion);
    breakdown.record_taxable(&person.name, result.taxable_portion);
    result.tax_free_portion + result.taxable_portion
        - calculate_marginal_tax(result.taxable_portion, existing, ctx.schedule)
}

/// Each accessible person in turn covers as much of `remaining` as their pots allow.
fn withdraw_from_pensions(
    people: &mut [Person],
    remaining: f64,
    ctx: &DrawdownContext<'_>,
    breakdown: &mut WithdrawalBreakdown,
) -> f64 {
    let mut remaining = remaining.max(0.0);
    for person in people.iter_mut() {
        if remaining <= PENNY {
            break;
        }
        remaining -= draw_pension_for_net(person, remaining, ctx, breakdown);
    }
    remaining.max(0.0)
}

/// Splits `remaining` across people in proportion to `capacity`, never asking anyone for more
/// than their own capacity. Returns what is still owed.
fn withdraw_pensions_proportionally(
    people: &mut [Person],
    remaining: f64,
    capacity: &[f64],
    ctx: &DrawdownContext<'_>,
    breakdown: &mut WithdrawalBreakdown,
) -> f64 {
    let total: f64 = capacity.iter().sum();
    if remaining <= PENNY || total <= 0.0 {
        return remaining.max(0.0);
    }
    let to_take = remaining.min(total);
    let mut still_owed = remaining;
    for (person, cap) in people.iter_mut().zip(capacity) {
        if *cap <= 0.0 {
            continue;
        }
        let share = (to_take * cap / total).min(*cap);
        still_owed -= draw_pension_for_net(person, share, ctx, breakdown);
    }
    still_owed.max(0.0)
}

/// Net cash a person could raise with `taxable_room` of extra taxable income.
fn band_capacity(person: &Person, taxable_room: f64, existing: f64, ctx: &DrawdownContext<'_>) -> f64 {
    if !person.can_access_pension(ctx.year) || person.total_pension() <= 0.0 || taxable_room <= 0.0 {
        return 0.0;
    }
    net_for_taxable_room(person, taxable_room, existing, ctx)
}

/// Draws on a scratch copy until `taxable_room` of taxable income is used or the pots run dry,
/// and returns the net cash that would raise. Tax-free cash from crystallising rides along.
fn net_for_taxable_room(
    person: &Person,
    taxable_room: f64,
    existing: f64,
    ctx: &DrawdownContext<'_>,
) -> f64 {
    let target_taxable = taxable_room.min(person.total_pension());
    if target_taxable <= 0.0 {
        return 0.0;
    }

    let mut scratch = person.clone();
    let mut taxable = 0.0;
    let mut tax_free = 0.0;
    let order = match ctx.crystallisation {
        CrystallisationStrategy::Gradual => [true, false],
        CrystallisationStrategy::Ufpls => [false, true],
    };
    for crystallised_first in order {
        let room = target_taxable - taxable;
        if room <= PENNY {
            break;
        }
        if crystallised_first {
            taxable += withdraw_from_crystallised(&mut scratch, room);
        } else {
            let fraction = tax_free_fraction(&scratch, ctx.crystallisation);
            let result = draw_uncrystallised(&mut scratch, room / (1.0 - fraction), ctx.crystallisation);
            taxable += result.taxable_portion;
            tax_free += result.tax_free_portion;
        }
    }
    tax_free + taxable - calculate_marginal_tax(taxable, existing, ctx.schedule)
}

/// Allowance first, then the basic band, then ISAs, then higher-rate pension.
fn tax_optimized(
    people: &mut [Person],
    net_needed: f64,
    ctx: &DrawdownContext<'_>,
    breakdown: &mut WithdrawalBreakdown,
) {
    if net_needed <= 0.0 {
        return;
    }
    let schedule = ctx.schedule;

    let allowance: Vec<f64> = people
        .iter()
        .map(|p| {
            let existing = ctx.existing_taxable(&p.name, breakdown);
            band_capacity(p, schedule.allowance_space(existing), existing, ctx)
        })
        .collect();
    let mut remaining = withdraw_pensions_proportionally(people, net_needed, &allowance, ctx, breakdown);

    let basic: Vec<f64> = people
        .iter()
        .map(|p| {
            let existing = ctx.existing_taxable(&p.name, breakdown);
            band_capacity(p, schedule.basic_band_space(existing), existing, ctx)
        })
        .collect();
    remaining = withdraw_pensions_proportionally(people, remaining, &basic, ctx, breakdown);

    remaining = withdraw_from_isas(people, remaining, breakdown);

    let higher: Vec<f64> = people
        .iter()
        .map(|p| {
            if p.can_access_pension(ctx.year) {
                p.total_pension()
            } else {
                0.0
            }
        })
        .collect();
    remaining = withdraw_pensions_proportionally(people, remaining, &higher, ctx, breakdown);
    withdraw_from_pensions(people, remaining, ctx, breakdown);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepositSplit {
    /// Even shares capped at each limit, then a second pass for anyone with room left.
    Equal,
    /// Fill each person's allowance in turn.
    Sequential,
}

/// Net a person would raise by filling their basic band.
fn net_to_fill_basic_band(
    person: &Person,
    ctx: &DrawdownContext<'_>,
    breakdown: &WithdrawalBreakdown,
) -> f64 {
    let existing = ctx.existing_taxable(&person.name, breakdown);
    let target_taxable = (ctx.schedule.basic_rate_limit() - existing).max(0.0);
    if target_taxable <= 0.0 || !person.can_access_pension(ctx.year) {
        return 0.0;
    }
    net_for_taxable_room(person, target_taxable, existing, ctx)
}

/// Over-draws pension up to the top of the basic band, banking whatever is not spent in ISAs.
fn fill_bands_to_isa(
    people: &mut [Person],
    net_needed: f64,
    ctx: &DrawdownContext<'_>,
    split: DepositSplit,
    breakdown: &mut WithdrawalBreakdown,
) {
    let isa_capacity: f64 = people.iter().map(|p| p.isa_annual_limit.max(0.0)).sum();
    let net_cap = net_needed + isa_capacity;
    let mut raised = 0.0;

    for person in people.iter_mut() {
        let room = net_cap - raised;
        if room <= PENNY {
            break;
        }
        let target = net_to_fill_basic_band(person, ctx, breakdown).min(room);
        raised += draw_pension_for_net(person, target, ctx, breakdown);
    }

    let is_pension_to_isa = matches!(
        ctx.order,
        DrawdownOrder::PensionToIsa | DrawdownOrder::PensionToIsaProactive
    );
    if is_pension_to_isa && ctx.maximize_couple_isa && raised >= net_needed {
        for person in people.iter_mut() {
            let room = net_cap - raised;
            if room <= PENNY {
                break;
            }
            raised += draw_pension_for_net(person, room, ctx, breakdown);
        }
    }

    let excess = raised - net_needed;
    if excess > PENNY {
        deposit_to_isas(people, excess, split, breakdown);
    } else if excess < -PENNY {
        let shortfall = withdraw_from_isas(people, -excess, breakdown);
        withdraw_from_pensions(people, shortfall, ctx, breakdown);
    }
}

fn deposit(person: &mut Person, amount: f64, breakdown: &mut WithdrawalBreakdown) {
    if amount <= 0.0 {
        return;
    }
    person.tax_free_savings += amount;
    breakdown.record_isa_deposit(&person.name, amount);
}

fn deposit_to_isas(
    people: &mut [Person],
    excess: f64,
    split: DepositSplit,
    breakdown: &mut WithdrawalBreakdown,
) {
    let mut remaining = excess;
    if split == DepositSplit::Equal && !people.is_empty() {
        let share = excess / people.len() as f64;
        for person in people.iter_mut() {
            let amount = share.min(person.isa_annual_limit).min(remaining);
            deposit(person, amount, breakdown);
            remaining -= amount.max(0.0);
        }
    }
    for person in people.iter_mut() {
        if remaining <= PENNY {
            break;
        }
        let room = (person.isa_annual_limit - breakdown.isa_deposit_for(&person.name)).max(0.0);
        let amount = remaining.min(room);
        deposit(person, amount, breakdown);
        remaining -= amount;
    }
}
