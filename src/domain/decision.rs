//! Business rules: given the current state of a lease and a command, decide
//! which events should be appended.
//!
//! Everything here is pure. The only clock the rules see is the command's
//! declared timestamp, and the gateway verdict is resolved by the caller
//! before `decide` runs.

use super::command::LeaseCommand;
use super::event::LeaseEvent;
use super::lease::{AggregateState, InstallmentStatus, LeaseAggregate, LeaseId, LeaseStatus};
use super::money::Money;
use super::ports::{Charge, GatewayVerdict};
use super::schedule::{self, payoff_quote};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Inputs the rules need beyond the state and the command itself.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    /// Target aggregate. For `CreateLease` this is the id the new lease gets.
    pub lease_id: LeaseId,
    pub issued_at: DateTime<Utc>,
    pub verdict: Option<GatewayVerdict>,
    pub payoff_discount_percent: Decimal,
    pub failure_threshold: u32,
}

/// The charge a command would put through the gateway, or `None` when the
/// command does not move money. Fails with the same errors `decide` would,
/// so an illegal command never reaches the gateway.
pub fn charge_for(
    state: &AggregateState,
    command: &LeaseCommand,
    payoff_discount_percent: Decimal,
) -> Result<Option<Charge>> {
    match command {
        LeaseCommand::AttemptPayment {
            installment_number,
            ..
        } => {
            let lease = active_lease(state, command)?;
            let installment = lease
                .installment(*installment_number)
                .ok_or_else(|| missing_installment(lease, *installment_number))?;
            if installment.status != InstallmentStatus::Pending {
                return Err(LedgerError::StateConflict(format!(
                    "installment {} of lease {} is {:?}, not PENDING",
                    installment_number, lease.lease_id, installment.status
                )));
            }
            Ok(Some(Charge {
                lease_id: lease.lease_id,
                payment_id: Some(installment.payment_id),
                installment_number: Some(*installment_number),
                amount: installment.amount,
            }))
        }
        LeaseCommand::EarlyPayoff { .. } => {
            let lease = active_lease(state, command)?;
            let quote = payoff_quote(lease.remaining_balance(), payoff_discount_percent);
            if !quote.payoff_amount.is_positive() {
                return Err(LedgerError::StateConflict(format!(
                    "lease {} has no outstanding balance to pay off",
                    lease.lease_id
                )));
            }
            Ok(Some(Charge {
                lease_id: lease.lease_id,
                payment_id: None,
                installment_number: None,
                amount: quote.payoff_amount,
            }))
        }
        LeaseCommand::CreateLease { .. }
        | LeaseCommand::ReopenInstallment { .. }
        | LeaseCommand::DefaultLease { .. } => Ok(None),
    }
}

pub fn decide(
    state: &AggregateState,
    command: &LeaseCommand,
    ctx: &DecisionContext,
) -> Result<Vec<LeaseEvent>> {
    match command {
        LeaseCommand::CreateLease {
            customer_id,
            principal_amount,
            term_months,
            first_due_date,
        } => {
            if state.exists() {
                return Err(LedgerError::StateConflict(format!(
                    "lease {} already exists",
                    ctx.lease_id
                )));
            }
            let customer_id = customer_id.trim();
            if customer_id.is_empty() {
                return Err(LedgerError::Validation(
                    "Customer id must not be empty".to_string(),
                ));
            }
            let principal = Money::new(*principal_amount);
            schedule::validate_terms(principal, *term_months)?;
            let first_due = match first_due_date {
                Some(date) => *date,
                None => schedule::default_first_due(ctx.issued_at.date_naive())?,
            };
            let installments =
                schedule::equal_installments(ctx.lease_id, principal, *term_months, first_due)?;

            let mut events = Vec::with_capacity(installments.len() + 2);
            events.push(LeaseEvent::LeaseCreated {
                customer_id: customer_id.to_string(),
                principal_amount: principal,
                term_months: *term_months,
            });
            events.extend(installments.into_iter().map(|i| {
                LeaseEvent::PaymentScheduled {
                    payment_id: i.payment_id,
                    installment_number: i.installment_number,
                    due_date: i.due_date,
                    amount: i.amount,
                }
            }));
            events.push(LeaseEvent::LeaseActivated);
            Ok(events)
        }

        LeaseCommand::AttemptPayment {
            installment_number,
            ..
        } => {
            charge_for(state, command, ctx.payoff_discount_percent)?;
            let lease = active_lease(state, command)?;
            let installment = lease
                .installment(*installment_number)
                .ok_or_else(|| missing_installment(lease, *installment_number))?;
            let attempt_number = installment.retry_count + 1;

            match required_verdict(ctx)? {
                GatewayVerdict::Succeeded => {
                    let mut events = vec![LeaseEvent::PaymentSucceeded {
                        installment_number: *installment_number,
                        attempt_number,
                        amount: installment.amount,
                    }];
                    let others_paid = lease
                        .installments
                        .iter()
                        .filter(|i| i.installment_number != *installment_number)
                        .all(|i| i.status == InstallmentStatus::Paid);
                    if lease.schedule_complete() && others_paid {
                        events.push(LeaseEvent::LeaseCompleted {
                            total_paid: lease.total_paid + installment.amount,
                        });
                    }
                    Ok(events)
                }
                GatewayVerdict::Failed { reason } => Ok(vec![LeaseEvent::PaymentFailed {
                    installment_number: *installment_number,
                    attempt_number,
                    reason: reason.clone(),
                }]),
            }
        }

        LeaseCommand::ReopenInstallment {
            installment_number,
            ..
        } => {
            let lease = active_lease(state, command)?;
            let installment = lease
                .installment(*installment_number)
                .ok_or_else(|| missing_installment(lease, *installment_number))?;
            if installment.status != InstallmentStatus::Failed {
                return Err(LedgerError::StateConflict(format!(
                    "installment {} of lease {} is {:?}, not FAILED",
                    installment_number, lease.lease_id, installment.status
                )));
            }
            if installment.retry_count >= ctx.failure_threshold {
                return Err(LedgerError::StateConflict(format!(
                    "installment {} of lease {} has exhausted its retries",
                    installment_number, lease.lease_id
                )));
            }
            Ok(vec![LeaseEvent::PaymentRetryDue {
                installment_number: *installment_number,
            }])
        }

        LeaseCommand::DefaultLease {
            installment_number,
            ..
        } => {
            let lease = active_lease(state, command)?;
            let installment = lease
                .installment(*installment_number)
                .ok_or_else(|| missing_installment(lease, *installment_number))?;
            if installment.retry_count < ctx.failure_threshold {
                return Err(LedgerError::StateConflict(format!(
                    "installment {} of lease {} has {} failed attempts; default needs {}",
                    installment_number,
                    lease.lease_id,
                    installment.retry_count,
                    ctx.failure_threshold
                )));
            }
            Ok(vec![LeaseEvent::LeaseDefaulted {
                installment_number: *installment_number,
                reason: format!(
                    "{} consecutive failed payment attempts",
                    installment.retry_count
                ),
            }])
        }

        LeaseCommand::EarlyPayoff { .. } => {
            charge_for(state, command, ctx.payoff_discount_percent)?;
            let lease = active_lease(state, command)?;
            let quote = payoff_quote(lease.remaining_balance(), ctx.payoff_discount_percent);

            match required_verdict(ctx)? {
                GatewayVerdict::Succeeded => Ok(vec![
                    LeaseEvent::EarlyPayoffSettled {
                        remaining_balance: quote.remaining_balance,
                        discount_amount: quote.discount_amount,
                        payoff_amount: quote.payoff_amount,
                    },
                    LeaseEvent::LeaseCompleted {
                        total_paid: lease.total_paid + quote.payoff_amount,
                    },
                ]),
                GatewayVerdict::Failed { reason } => Err(LedgerError::PaymentDeclined(format!(
                    "early payoff of {} for lease {}: {}",
                    quote.payoff_amount, lease.lease_id, reason
                ))),
            }
        }
    }
}

fn active_lease<'a>(state: &'a AggregateState, command: &LeaseCommand) -> Result<&'a LeaseAggregate> {
    let lease = state.lease.as_ref().ok_or_else(|| {
        LedgerError::StateConflict(format!(
            "{} targets a lease that does not exist",
            command.operation()
        ))
    })?;
    if lease.status != LeaseStatus::Active {
        return Err(LedgerError::StateConflict(format!(
            "{} rejected for lease {} in status {}",
            command.operation(),
            lease.lease_id,
            lease.status
        )));
    }
    Ok(lease)
}

fn missing_installment(lease: &LeaseAggregate, number: u32) -> LedgerError {
    LedgerError::Validation(format!(
        "lease {} has no installment {}",
        lease.lease_id, number
    ))
}

fn required_verdict(ctx: &DecisionContext) -> Result<&GatewayVerdict> {
    ctx.verdict
        .as_ref()
        .ok_or_else(|| LedgerError::Validation("payment verdict is required".to_string()))
}
