#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use chrono::{Duration, TimeZone, Utc};
use lease_ledger::domain::command::{LeaseCommand, RequestFingerprint};
use lease_ledger::domain::lease::LeaseId;
use lease_ledger::domain::ports::{BeginOutcome, IdempotencyGuard};
use lease_ledger::error::LedgerError;
use lease_ledger::infrastructure::rocksdb::RocksDbStore;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

const HEADER: &str = "op,key,lease,customer,amount,term,installment,at,outcome";
const CREATE: &str = "create,c-1,L1,cust-1,300,3,,2025-01-01T00:00:00Z,";

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: create a lease and pay the first installment
    let mut script1 = tempfile::NamedTempFile::new().unwrap();
    writeln!(script1, "{HEADER}").unwrap();
    writeln!(script1, "{CREATE}").unwrap();
    writeln!(script1, "pay,p-1,L1,,,,1,2025-01-31T00:00:00Z,ok").unwrap();

    let output1 = Command::new(cargo_bin!("lease-ledger"))
        .arg(script1.path())
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert_eq!(stdout1.matches("PAYMENT_SUCCEEDED").count(), 1);

    // 2. Second run: the create replays from the stored idempotency record,
    //    which rebinds the alias to the same lease
    let mut script2 = tempfile::NamedTempFile::new().unwrap();
    writeln!(script2, "{HEADER}").unwrap();
    writeln!(script2, "{CREATE}").unwrap();
    writeln!(script2, "pay,p-2,L1,,,,2,2025-03-02T00:00:00Z,ok").unwrap();

    let output2 = Command::new(cargo_bin!("lease-ledger"))
        .arg(script2.path())
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);

    assert_eq!(stdout2.matches("LEASE_CREATED").count(), 1);
    assert_eq!(stdout2.matches("PAYMENT_SUCCEEDED").count(), 2);
}

#[test]
fn test_rocksdb_rehydrates_retry_timers() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    let mut script1 = tempfile::NamedTempFile::new().unwrap();
    writeln!(script1, "{HEADER}").unwrap();
    writeln!(script1, "{CREATE}").unwrap();
    writeln!(script1, "pay,p-1,L1,,,,1,2025-01-31T00:00:00Z,fail").unwrap();

    let output1 = Command::new(cargo_bin!("lease-ledger"))
        .arg(script1.path())
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output1.status.success());

    // the retry timer only lives in memory; a restart must rebuild it
    let mut script2 = tempfile::NamedTempFile::new().unwrap();
    writeln!(script2, "{HEADER}").unwrap();
    writeln!(script2, "tick,,,,,,,2025-02-01T00:00:00Z,ok").unwrap();

    let output2 = Command::new(cargo_bin!("lease-ledger"))
        .arg(script2.path())
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);
    assert!(stdout2.contains("PAYMENT_RETRY_DUE"));
    assert_eq!(stdout2.matches("PAYMENT_SUCCEEDED").count(), 1);
}

#[tokio::test]
async fn test_rocksdb_reopen_releases_keys_left_in_flight() {
    let dir = tempdir().unwrap();
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let lease_id = LeaseId::new();
    let fingerprint = RequestFingerprint::of(&LeaseCommand::EarlyPayoff { lease_id }).unwrap();

    {
        let store = RocksDbStore::open(dir.path(), Duration::hours(24)).unwrap();
        store
            .begin("EARLY_PAYOFF", "completed", &fingerprint, t0)
            .await
            .unwrap();
        store
            .complete("EARLY_PAYOFF", "completed", serde_json::json!({"status": "COMPLETED"}))
            .await
            .unwrap();
        // the process dies before this one completes
        store
            .begin("EARLY_PAYOFF", "crashed", &fingerprint, t0)
            .await
            .unwrap();
        assert!(matches!(
            store.begin("EARLY_PAYOFF", "crashed", &fingerprint, t0).await,
            Err(LedgerError::DuplicateInFlight { .. })
        ));
    }

    let store = RocksDbStore::open(dir.path(), Duration::hours(24)).unwrap();
    assert_eq!(
        store
            .begin("EARLY_PAYOFF", "crashed", &fingerprint, t0)
            .await
            .unwrap(),
        BeginOutcome::Proceed
    );
    assert_eq!(
        store
            .begin("EARLY_PAYOFF", "completed", &fingerprint, t0)
            .await
            .unwrap(),
        BeginOutcome::Replay(serde_json::json!({"status": "COMPLETED"}))
    );
}
