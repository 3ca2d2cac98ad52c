use chrono::Utc;
use clap::{Parser, ValueEnum};
use lease_ledger::application::engine::{ExportFilter, LeaseEngine};
use lease_ledger::config::LedgerConfig;
use lease_ledger::domain::lease::LeaseId;
use lease_ledger::domain::ports::{EventStoreRef, IdempotencyGuardRef};
use lease_ledger::infrastructure::clock::ManualClock;
use lease_ledger::infrastructure::gateway::ScriptedGateway;
use lease_ledger::infrastructure::in_memory::{InMemoryEventStore, InMemoryIdempotencyGuard};
use lease_ledger::infrastructure::publishers::TracingPublisher;
#[cfg(feature = "storage-rocksdb")]
use lease_ledger::infrastructure::rocksdb::RocksDbStore;
use lease_ledger::interfaces::csv::command_reader::CommandReader;
use lease_ledger::interfaces::export::AuditWriter;
use lease_ledger::interfaces::script::ScriptRunner;
use lease_ledger::telemetry;
use miette::{IntoDiagnostic, Result, miette};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Command script CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Output format of the audit export
    #[arg(long, value_enum, default_value_t = Format::Csv)]
    format: Format,

    /// Only export events of this lease (script alias or lease id)
    #[arg(long)]
    lease: Option<String>,

    /// Only export events of these types (repeatable)
    #[arg(long = "event-type")]
    event_types: Vec<String>,

    /// Overrides LEDGER_IDEMPOTENCY_TTL_SECS
    #[arg(long)]
    idempotency_ttl_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    let mut config = LedgerConfig::from_env();
    if let Some(secs) = cli.idempotency_ttl_secs {
        config.idempotency_ttl = Duration::from_secs(secs);
    }
    config.validate().into_diagnostic()?;

    let file = File::open(&cli.input).into_diagnostic()?;
    let rows: Vec<_> = CommandReader::new(file).rows().collect();

    // The clock starts at the script's first declared time and only moves forward.
    let start = rows
        .iter()
        .filter_map(|row| row.as_ref().ok())
        .find_map(|row| row.at)
        .unwrap_or_else(Utc::now);
    let clock = ManualClock::new(start);
    let gateway = ScriptedGateway::new();

    let (store, guard) = open_storage(cli.db_path.as_deref(), &config)?;
    let engine = LeaseEngine::new(
        &config,
        store,
        guard,
        Arc::new(gateway.clone()),
        Arc::new(TracingPublisher),
        Arc::new(clock.clone()),
    )
    .into_diagnostic()?;
    engine.rehydrate().await.into_diagnostic()?;

    let mut runner = ScriptRunner::new(&engine, gateway, clock);
    let report = runner.run(rows).await;
    tracing::info!(
        applied = report.applied,
        rejected = report.rejected,
        "script replayed"
    );

    let lease_id = match cli.lease.as_deref() {
        Some(lease) => Some(
            runner
                .lease_id(lease)
                .or_else(|| lease.parse::<LeaseId>().ok())
                .ok_or_else(|| miette!("unknown lease '{lease}'"))?,
        ),
        None => None,
    };
    let filter = ExportFilter {
        lease_id,
        event_types: cli.event_types,
    };
    let records = engine.export(&filter).await.into_diagnostic()?;

    let stdout = io::stdout();
    let writer = AuditWriter::new(stdout.lock());
    match cli.format {
        Format::Json => writer.write_json(&records),
        Format::Csv => writer.write_csv(&records),
    }
    .into_diagnostic()?;

    Ok(())
}

fn open_storage(
    db_path: Option<&Path>,
    config: &LedgerConfig,
) -> Result<(EventStoreRef, IdempotencyGuardRef)> {
    let ttl = config.idempotency_ttl().into_diagnostic()?;
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store = RocksDbStore::open(path, ttl).into_diagnostic()?;
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => Err(miette!(
            "--db-path requires a build with the storage-rocksdb feature"
        )),
        None => Ok((
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryIdempotencyGuard::new(ttl)),
        )),
    }
}
