mod common;

use chrono::Duration;
use common::{harness, start};
use lease_ledger::domain::command::LeaseCommand;
use lease_ledger::domain::event::LeaseEvent;
use lease_ledger::domain::lease::{InstallmentStatus, LeaseId, LeaseStatus};
use lease_ledger::domain::money::Money;
use lease_ledger::domain::ports::{Clock, EventStore, GatewayVerdict};
use lease_ledger::error::LedgerError;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_create_lease_generates_schedule_and_activates() {
    let h = harness();
    let response = h.create(dec!(1200.00), 12).await;

    assert_eq!(response.status, LeaseStatus::Active);
    assert_eq!(response.event_types.len(), 14);
    assert_eq!(response.event_types.first().unwrap(), "LEASE_CREATED");
    assert_eq!(response.event_types.last().unwrap(), "LEASE_ACTIVATED");

    let lease = h.engine.state(response.lease_id).await.unwrap().lease.unwrap();
    assert_eq!(lease.installments.len(), 12);
    for installment in &lease.installments {
        assert_eq!(installment.amount, Money::new(dec!(100.00)));
        assert_eq!(installment.status, InstallmentStatus::Pending);
    }

    let timeline = h.engine.timeline(response.lease_id).await.unwrap();
    assert_eq!(timeline[0].status_before, None);
    assert_eq!(timeline[0].status_after, Some(LeaseStatus::Pending));
    let activated = timeline.last().unwrap();
    assert_eq!(activated.status_before, Some(LeaseStatus::Pending));
    assert_eq!(activated.status_after, Some(LeaseStatus::Active));
}

#[tokio::test]
async fn test_three_failures_default_the_lease() {
    let h = harness();
    let lease_id = h.create(dec!(1200.00), 12).await.lease_id;
    for _ in 0..3 {
        h.gateway.push_failure("Insufficient funds").await;
    }

    let first = h.pay(lease_id, 1).await.unwrap();
    assert_eq!(first.event_types, vec!["PAYMENT_FAILED"]);

    // first retry after base delay, second after twice that
    h.clock.advance(Duration::minutes(1));
    h.engine.poll_retries(h.clock.now()).await.unwrap();
    h.clock.advance(Duration::minutes(2));
    h.engine.poll_retries(h.clock.now()).await.unwrap();

    let state = h.engine.state(lease_id).await.unwrap();
    assert_eq!(state.status(), Some(LeaseStatus::Defaulted));
    let lease = state.lease.unwrap();
    assert_eq!(lease.installment(1).unwrap().retry_count, 3);
    assert!(
        lease
            .installments
            .iter()
            .all(|i| i.status == InstallmentStatus::Cancelled)
    );

    // no fourth attempt
    assert_eq!(h.engine.scheduler().pending().await, 0);
    h.clock.advance(Duration::days(1));
    assert!(h.engine.poll_retries(h.clock.now()).await.unwrap().is_empty());
    assert_eq!(h.gateway.charges().await.len(), 3);
}

#[tokio::test]
async fn test_gateway_outage_during_retry_keeps_the_retry_loop_alive() {
    let h = harness();
    let lease_id = h.create(dec!(1200.00), 12).await.lease_id;

    h.gateway.push_failure("Card declined").await;
    h.pay(lease_id, 1).await.unwrap();

    // the retry reopens the installment, then the gateway cannot be reached
    h.gateway.fail_next(1).await;
    h.clock.advance(Duration::minutes(1));
    assert!(h.engine.poll_retries(h.clock.now()).await.unwrap().is_empty());

    let lease = h.engine.state(lease_id).await.unwrap().lease.unwrap();
    let installment = lease.installment(1).unwrap();
    assert_eq!(installment.status, InstallmentStatus::Pending);
    assert_eq!(installment.retry_count, 1);
    assert_eq!(h.engine.scheduler().pending().await, 1);

    h.gateway.push_failure("Card declined").await;
    h.clock.advance(Duration::minutes(1));
    let responses = h.engine.poll_retries(h.clock.now()).await.unwrap();
    assert_eq!(responses[0].event_types, vec!["PAYMENT_FAILED"]);
    assert_eq!(h.engine.scheduler().pending().await, 1);

    h.clock.advance(Duration::minutes(2));
    let responses = h.engine.poll_retries(h.clock.now()).await.unwrap();
    assert_eq!(responses[0].event_types, vec!["PAYMENT_SUCCEEDED"]);

    let lease = h.engine.state(lease_id).await.unwrap().lease.unwrap();
    let installment = lease.installment(1).unwrap();
    assert_eq!(installment.status, InstallmentStatus::Paid);
    assert_eq!(installment.retry_count, 2);
    assert_eq!(h.gateway.charges().await.len(), 4);
}

#[tokio::test]
async fn test_twelve_payments_complete_the_lease() {
    let h = harness();
    let lease_id = h.create(dec!(1200.00), 12).await.lease_id;

    for n in 1..=11 {
        h.clock.advance(Duration::days(30));
        let response = h.pay(lease_id, n).await.unwrap();
        assert_eq!(response.status, LeaseStatus::Active);
        assert_eq!(response.amount_charged, Some(Money::new(dec!(100))));
    }

    h.clock.advance(Duration::days(30));
    let last = h.pay(lease_id, 12).await.unwrap();
    assert_eq!(last.status, LeaseStatus::Completed);
    assert_eq!(last.event_types, vec!["PAYMENT_SUCCEEDED", "LEASE_COMPLETED"]);

    let err = h.pay(lease_id, 1).await.unwrap_err();
    assert!(matches!(err, LedgerError::StateConflict(_)));
}

#[tokio::test]
async fn test_repeated_create_replays_first_response() {
    let h = harness();
    let first = h.create(dec!(1200.00), 12).await;
    let second = h.create(dec!(1200.00), 12).await;

    assert_eq!(first, second);

    let created = h
        .store
        .read_all()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.event_type == "LEASE_CREATED")
        .count();
    assert_eq!(created, 1);
    assert_eq!(h.publisher.published().await.len(), 14);
}

#[tokio::test]
async fn test_state_before_creation_does_not_exist() {
    let h = harness();
    let lease_id = h.create(dec!(1200.00), 12).await.lease_id;

    let before = h
        .engine
        .state_at(lease_id, start() - Duration::seconds(1))
        .await
        .unwrap();
    assert!(!before.exists());
    assert_eq!(before.version, 0);

    let unknown = h.engine.state_at(LeaseId::new(), start()).await.unwrap();
    assert!(!unknown.exists());
}

#[tokio::test]
async fn test_early_payoff_discounts_remaining_balance() {
    let h = harness();
    let lease_id = h.create(dec!(1200.00), 12).await.lease_id;
    for n in 1..=8 {
        h.clock.advance(Duration::days(30));
        h.pay(lease_id, n).await.unwrap();
    }

    h.clock.advance(Duration::days(1));
    let response = h.payoff(lease_id, "payoff-1").await.unwrap();
    assert_eq!(response.status, LeaseStatus::Completed);
    assert_eq!(response.amount_charged, Some(Money::new(dec!(392.00))));
    assert_eq!(
        response.event_types,
        vec!["EARLY_PAYOFF_SETTLED", "LEASE_COMPLETED"]
    );

    let records = h.store.read(lease_id, 0).await.unwrap();
    let settled = records
        .iter()
        .find(|r| r.event_type == "EARLY_PAYOFF_SETTLED")
        .unwrap();
    match LeaseEvent::decode(settled).unwrap() {
        LeaseEvent::EarlyPayoffSettled {
            remaining_balance,
            discount_amount,
            payoff_amount,
        } => {
            assert_eq!(remaining_balance, Money::new(dec!(400.00)));
            assert_eq!(discount_amount, Money::new(dec!(8.00)));
            assert_eq!(payoff_amount, Money::new(dec!(392.00)));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let lease = h.engine.state(lease_id).await.unwrap().lease.unwrap();
    for installment in &lease.installments[8..] {
        assert_eq!(installment.status, InstallmentStatus::Cancelled);
    }
}

#[tokio::test]
async fn test_declined_payoff_appends_nothing() {
    let h = harness();
    let lease_id = h.create(dec!(1200.00), 12).await.lease_id;
    let before = h.store.current_sequence(lease_id).await.unwrap();

    h.gateway
        .push(GatewayVerdict::Failed {
            reason: "Card expired".to_string(),
        })
        .await;
    let err = h.payoff(lease_id, "payoff-1").await.unwrap_err();
    assert!(matches!(err, LedgerError::PaymentDeclined(_)));
    assert_eq!(h.store.current_sequence(lease_id).await.unwrap(), before);

    // the key was released, so the caller may retry it
    let retried = h.payoff(lease_id, "payoff-1").await.unwrap();
    assert_eq!(retried.status, LeaseStatus::Completed);
}

#[tokio::test]
async fn test_key_reuse_with_different_body_is_rejected() {
    let h = harness();
    let lease_id = h.create(dec!(1200.00), 12).await.lease_id;
    h.pay(lease_id, 1).await.unwrap();
    let before = h.store.current_sequence(lease_id).await.unwrap();

    let other = h.envelope(
        LeaseCommand::AttemptPayment {
            lease_id,
            installment_number: 2,
        },
        "pay-1",
    );
    let err = h.engine.submit(other).await.unwrap_err();
    assert!(matches!(err, LedgerError::IdempotencyKeyReuse { .. }));
    assert_eq!(h.store.current_sequence(lease_id).await.unwrap(), before);
}

#[tokio::test]
async fn test_replay_after_idempotency_expiry_finds_origin_events() {
    let h = harness();
    let first = h.create(dec!(600.00), 6).await;
    let events = h.store.read_all().await.unwrap().len();

    h.clock.advance(Duration::hours(25));
    assert_eq!(h.engine.sweep_idempotency().await.unwrap(), 1);

    let envelope = h.envelope(
        LeaseCommand::CreateLease {
            customer_id: "cust-1".to_string(),
            principal_amount: dec!(600.00),
            term_months: 6,
            first_due_date: None,
        },
        "create-1",
    );
    let again = h.engine.submit(envelope).await.unwrap();

    assert_eq!(again, first);
    assert_eq!(h.store.read_all().await.unwrap().len(), events);
}

#[tokio::test]
async fn test_expired_key_reused_for_another_installment_runs_the_new_command() {
    let h = harness();
    let lease_id = h.create(dec!(1200.00), 12).await.lease_id;
    let pay = |installment_number| {
        h.envelope(
            LeaseCommand::AttemptPayment {
                lease_id,
                installment_number,
            },
            "pay-x",
        )
    };

    let first = h.engine.submit(pay(1)).await.unwrap();
    h.clock.advance(Duration::hours(25));
    h.engine.sweep_idempotency().await.unwrap();

    let second = h.engine.submit(pay(2)).await.unwrap();
    assert_ne!(second, first);
    assert_eq!(second.event_types, vec!["PAYMENT_SUCCEEDED"]);
    assert_eq!(second.last_sequence_no, first.last_sequence_no + 1);

    let lease = h.engine.state(lease_id).await.unwrap().lease.unwrap();
    assert_eq!(lease.installment(2).unwrap().status, InstallmentStatus::Paid);
    assert_eq!(h.gateway.charges().await.len(), 2);
}

#[tokio::test]
async fn test_failed_publish_is_parked_and_redelivered_in_order() {
    let h = harness();
    h.publisher.fail_next(1).await;
    let lease_id = h.create(dec!(300.00), 3).await.lease_id;

    // the first event failed; the rest of the stream queues behind it
    assert_eq!(h.engine.dead_letter_count().await, 5);
    assert!(h.publisher.published().await.is_empty());

    let report = h.engine.redeliver_dead_letters().await;
    assert_eq!(report.delivered, 5);
    assert_eq!(report.remaining, 0);

    let sequences: Vec<u64> = h
        .publisher
        .published()
        .await
        .iter()
        .filter(|e| e.aggregate_id == lease_id)
        .map(|e| e.sequence_no)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_payments_on_the_same_lease_race_and_both_commit() {
    let h = harness();
    let lease_id = h.create(dec!(300.00), 3).await.lease_id;

    let (a, b) = tokio::join!(h.pay(lease_id, 1), h.pay(lease_id, 2));
    assert!(a.is_ok());
    assert!(b.is_ok());

    let sequences: Vec<u64> = h
        .store
        .read(lease_id, 0)
        .await
        .unwrap()
        .iter()
        .map(|r| r.sequence_no)
        .collect();
    assert_eq!(sequences, (1..=7).collect::<Vec<u64>>());
}
