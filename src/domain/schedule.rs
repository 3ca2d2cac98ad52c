use super::lease::LeaseId;
use super::money::Money;
use crate::error::{LedgerError, Result};
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;

pub const MIN_TERM_MONTHS: u32 = 1;
pub const MAX_TERM_MONTHS: u32 = 60;
/// Days between consecutive due dates, and before the first one.
pub const INSTALLMENT_SPACING_DAYS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledInstallment {
    pub payment_id: uuid::Uuid,
    pub installment_number: u32,
    pub due_date: NaiveDate,
    pub amount: Money,
}

pub fn validate_terms(principal: Money, term_months: u32) -> Result<()> {
    if !principal.is_positive() {
        return Err(LedgerError::Validation(
            "Principal amount must be positive".to_string(),
        ));
    }
    if !(MIN_TERM_MONTHS..=MAX_TERM_MONTHS).contains(&term_months) {
        return Err(LedgerError::Validation(format!(
            "Term must be between {MIN_TERM_MONTHS} and {MAX_TERM_MONTHS} months"
        )));
    }
    Ok(())
}

/// Splits `principal` into equal monthly installments rounded to cents. The
/// last installment absorbs the rounding remainder so the schedule always sums
/// to the principal.
pub fn equal_installments(
    lease_id: LeaseId,
    principal: Money,
    term_months: u32,
    first_due: NaiveDate,
) -> Result<Vec<ScheduledInstallment>> {
    validate_terms(principal, term_months)?;

    let monthly = Money::new(principal.value() / Decimal::from(term_months));
    let mut schedule = Vec::with_capacity(term_months as usize);

    for number in 1..=term_months {
        let offset = INSTALLMENT_SPACING_DAYS * u64::from(number - 1);
        let due_date = first_due
            .checked_add_days(Days::new(offset))
            .ok_or_else(|| LedgerError::Validation("due date out of range".to_string()))?;

        let amount = if number == term_months {
            principal - Money::new(monthly.value() * Decimal::from(term_months - 1))
        } else {
            monthly
        };

        schedule.push(ScheduledInstallment {
            payment_id: lease_id.payment_id(number),
            installment_number: number,
            due_date,
            amount,
        });
    }

    Ok(schedule)
}

/// First due date for a lease created on `created_on`.
pub fn default_first_due(created_on: NaiveDate) -> Result<NaiveDate> {
    created_on
        .checked_add_days(Days::new(INSTALLMENT_SPACING_DAYS))
        .ok_or_else(|| LedgerError::Validation("due date out of range".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayoffQuote {
    pub remaining_balance: Money,
    pub discount_amount: Money,
    pub payoff_amount: Money,
}

pub fn payoff_quote(remaining_balance: Money, discount_percent: Decimal) -> PayoffQuote {
    let discount_amount = remaining_balance.percent(discount_percent);
    PayoffQuote {
        remaining_balance,
        discount_amount,
        payoff_amount: remaining_balance - discount_amount,
    }
}
