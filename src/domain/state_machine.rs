//! Pure reducer for lease streams.
//!
//! `reduce` folds an ordered slice of records into an [`AggregateState`]. It
//! performs no I/O and reads no clock, so folding the same records always
//! yields the same state. Illegal transitions are rejected rather than
//! skipped: a stream that fails to reduce is corrupt, and a candidate batch
//! that fails to reduce must never be committed.

use super::event::{EventRecord, LeaseEvent};
use super::lease::{
    AggregateState, InstallmentStatus, LeaseAggregate, LeaseStatus, PaymentInstallment,
    PayoffSummary,
};
use super::money::Money;
use crate::error::{LedgerError, Result};

/// Failed attempts on one installment that put its lease into default.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

pub fn reduce(events: &[EventRecord]) -> Result<AggregateState> {
    fold(AggregateState::default(), events)
}

/// Continues a fold from an already-derived state.
pub fn fold(state: AggregateState, events: &[EventRecord]) -> Result<AggregateState> {
    events.iter().try_fold(state, apply)
}

pub fn apply(mut state: AggregateState, record: &EventRecord) -> Result<AggregateState> {
    if record.sequence_no != state.version + 1 {
        return Err(LedgerError::Validation(format!(
            "event {} out of order: expected sequence {}, got {}",
            record.aggregate_id,
            state.version + 1,
            record.sequence_no
        )));
    }
    if let Some(last) = state.last_event_at
        && record.timestamp < last
    {
        return Err(LedgerError::Validation(format!(
            "event {} #{} is timestamped before its predecessor",
            record.aggregate_id, record.sequence_no
        )));
    }

    let event = LeaseEvent::decode(record)?;

    let lease = match (state.lease.take(), event) {
        (
            None,
            LeaseEvent::LeaseCreated {
                customer_id,
                principal_amount,
                term_months,
            },
        ) => LeaseAggregate {
            lease_id: record.aggregate_id,
            customer_id,
            status: LeaseStatus::Pending,
            principal_amount,
            term_months,
            installments: Vec::with_capacity(term_months as usize),
            total_paid: Money::ZERO,
            payoff: None,
            created_at: record.timestamp,
            updated_at: record.timestamp,
        },
        (None, other) => {
            return Err(LedgerError::StateConflict(format!(
                "{} on lease {} which does not exist",
                other.event_type(),
                record.aggregate_id
            )));
        }
        (Some(lease), event) => transition(lease, event, record)?,
    };

    state.version = record.sequence_no;
    state.last_event_at = Some(record.timestamp);
    state.lease = Some(lease);
    Ok(state)
}

fn transition(
    mut lease: LeaseAggregate,
    event: LeaseEvent,
    record: &EventRecord,
) -> Result<LeaseAggregate> {
    if lease.status.is_terminal() {
        return Err(conflict(&lease, &event, "lease is terminal"));
    }

    match &event {
        LeaseEvent::LeaseCreated { .. } => {
            return Err(conflict(&lease, &event, "lease already exists"));
        }
        LeaseEvent::PaymentScheduled {
            payment_id,
            installment_number,
            due_date,
            amount,
        } => {
            require_status(&lease, &event, LeaseStatus::Pending)?;
            let expected = lease.installments.len() as u32 + 1;
            if *installment_number != expected || *installment_number > lease.term_months {
                return Err(LedgerError::Validation(format!(
                    "installment {} scheduled out of order on lease {} (expected {})",
                    installment_number, lease.lease_id, expected
                )));
            }
            lease.installments.push(PaymentInstallment {
                payment_id: *payment_id,
                lease_id: lease.lease_id,
                installment_number: *installment_number,
                due_date: *due_date,
                amount: *amount,
                status: InstallmentStatus::Pending,
                retry_count: 0,
                last_attempt_at: None,
            });
        }
        LeaseEvent::LeaseActivated => {
            require_status(&lease, &event, LeaseStatus::Pending)?;
            if !lease.schedule_complete() {
                return Err(conflict(&lease, &event, "schedule is not fully generated"));
            }
            lease.status = LeaseStatus::Active;
        }
        LeaseEvent::PaymentSucceeded {
            installment_number,
            amount,
            ..
        } => {
            require_status(&lease, &event, LeaseStatus::Active)?;
            let installment = installment_in(&mut lease, *installment_number)?;
            if installment.status != InstallmentStatus::Pending {
                return Err(installment_conflict(installment, "PAYMENT_SUCCEEDED"));
            }
            if installment.amount != *amount {
                return Err(LedgerError::Validation(format!(
                    "payment of {} does not match installment {} amount {}",
                    amount, installment_number, installment.amount
                )));
            }
            installment.status = InstallmentStatus::Paid;
            installment.last_attempt_at = Some(record.timestamp);
            lease.total_paid += *amount;
        }
        LeaseEvent::PaymentFailed {
            installment_number,
            ..
        } => {
            require_status(&lease, &event, LeaseStatus::Active)?;
            let installment = installment_in(&mut lease, *installment_number)?;
            if installment.status != InstallmentStatus::Pending {
                return Err(installment_conflict(installment, "PAYMENT_FAILED"));
            }
            installment.status = InstallmentStatus::Failed;
            installment.retry_count += 1;
            installment.last_attempt_at = Some(record.timestamp);
        }
        LeaseEvent::PaymentRetryDue { installment_number } => {
            require_status(&lease, &event, LeaseStatus::Active)?;
            let installment = installment_in(&mut lease, *installment_number)?;
            if installment.status != InstallmentStatus::Failed {
                return Err(installment_conflict(installment, "PAYMENT_RETRY_DUE"));
            }
            installment.status = InstallmentStatus::Pending;
        }
        LeaseEvent::EarlyPayoffSettled {
            remaining_balance,
            discount_amount,
            payoff_amount,
        } => {
            require_status(&lease, &event, LeaseStatus::Active)?;
            if lease.payoff.is_some() {
                return Err(conflict(&lease, &event, "payoff already settled"));
            }
            lease.cancel_open_installments();
            lease.total_paid += *payoff_amount;
            lease.payoff = Some(PayoffSummary {
                remaining_balance: *remaining_balance,
                discount_amount: *discount_amount,
                payoff_amount: *payoff_amount,
            });
        }
        LeaseEvent::LeaseCompleted { .. } => {
            require_status(&lease, &event, LeaseStatus::Active)?;
            if !lease.can_complete() {
                return Err(conflict(&lease, &event, "installments remain unpaid"));
            }
            lease.status = LeaseStatus::Completed;
        }
        LeaseEvent::LeaseDefaulted { .. } => {
            require_status(&lease, &event, LeaseStatus::Active)?;
            if lease
                .defaulting_installment(DEFAULT_FAILURE_THRESHOLD)
                .is_none()
            {
                return Err(conflict(
                    &lease,
                    &event,
                    "no installment has reached the failure threshold",
                ));
            }
            lease.cancel_open_installments();
            lease.status = LeaseStatus::Defaulted;
        }
    }

    lease.updated_at = record.timestamp;
    Ok(lease)
}

fn require_status(lease: &LeaseAggregate, event: &LeaseEvent, status: LeaseStatus) -> Result<()> {
    if lease.status == status {
        Ok(())
    } else {
        Err(conflict(lease, event, &format!("requires status {status}")))
    }
}

fn installment_in(lease: &mut LeaseAggregate, number: u32) -> Result<&mut PaymentInstallment> {
    let lease_id = lease.lease_id;
    lease.installment_mut(number).ok_or_else(|| {
        LedgerError::Validation(format!(
            "lease {lease_id} has no installment {number}"
        ))
    })
}

fn conflict(lease: &LeaseAggregate, event: &LeaseEvent, reason: &str) -> LedgerError {
    LedgerError::StateConflict(format!(
        "{} rejected for lease {} in status {}: {}",
        event.event_type(),
        lease.lease_id,
        lease.status,
        reason
    ))
}

fn installment_conflict(installment: &PaymentInstallment, event_type: &str) -> LedgerError {
    LedgerError::StateConflict(format!(
        "{} rejected for installment {} of lease {} in status {:?}",
        event_type, installment.installment_number, installment.lease_id, installment.status
    ))
}
