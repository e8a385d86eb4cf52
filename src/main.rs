use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use ledger_statements::{
    consolidate, ChartAccountType, ChartOfAccounts, CsvEntrySource, EntrySource, Pipeline,
    PipelineConfig, RunEvent, SqliteStore, UnitOutcome, VERSION,
};

const USAGE: &str =
    "usage: ledger-statements import <entries.csv> <chart.json> <db-path> [config.json]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("import") if args.len() >= 5 => run_import(
            Path::new(&args[2]),
            Path::new(&args[3]),
            Path::new(&args[4]),
            args.get(5).map(Path::new),
        ),
        Some("--version") => {
            println!("ledger-statements {}", VERSION);
            Ok(())
        }
        _ => bail!(USAGE),
    }
}

fn run_import(
    entries_path: &Path,
    chart_path: &Path,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<()> {
    println!("📒 Ledger Statements - ERP entries → DRE + DFC");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. Configuration
    let config = PipelineConfig::load(config_path).context("Failed to load configuration")?;
    println!("\n⚙️  Batch size {}, text limit {}", config.batch_size, config.max_text_len);
    if !config.disabled_rules.is_empty() {
        println!("   Disabled rules: {:?}", config.disabled_rules);
    }

    // 2. Chart of accounts (fully built before any classification)
    println!("\n📂 Loading chart of accounts...");
    let chart = ChartOfAccounts::from_file(chart_path)?;
    println!(
        "✓ {} accounts ({} receivable, {} payable)",
        chart.count(),
        chart.count_by_type(ChartAccountType::Receivable),
        chart.count_by_type(ChartAccountType::Payable)
    );

    // 3. Entries
    println!("\n📂 Loading entries...");
    let mut source = CsvEntrySource::from_path(entries_path)?;
    let units = source.units();
    println!("✓ {} entries across {} units", source.entry_count(), units.len());
    if !source.unassigned().is_empty() {
        println!(
            "⚠️  {} rows without a valid entity id will be counted as rejected",
            source.unassigned().len()
        );
    }

    // 4. Database
    println!("\n🔧 Setting up database...");
    let mut store = SqliteStore::open(db_path)?;
    println!("✓ Database initialized with WAL mode");

    // 5. Run
    println!("\n🔄 Processing units...");
    let pipeline = Pipeline::from_config(chart, &config)?;
    let report = pipeline.run(&units, &mut source, &mut store);

    for outcome in &report.outcomes {
        match outcome {
            UnitOutcome::Completed { report: unit, applied } => {
                println!(
                    "✓ {}: {} DRE rows, {} DFC rows, {} written, {} stale removed, {} batches rejected",
                    unit.unit,
                    unit.statements.dre.len(),
                    unit.statements.dfc.len(),
                    applied.rows_written,
                    applied.rows_pruned,
                    applied.batches_rejected
                );
                for entry in &unit.defaulted {
                    println!(
                        "   ⚠️  defaulted to expense: {} ({})",
                        entry.reference.as_deref().unwrap_or("-"),
                        entry.account.as_deref().unwrap_or("no account")
                    );
                }
            }
            UnitOutcome::Failed { unit, error } => println!("❌ {}: {}", unit, error),
        }
    }

    let group = consolidate(report.completed().map(|u| &u.aggregation));
    println!(
        "\n📊 Group view: {} DRE rows, {} DFC rows",
        group.dre.len(),
        group.dfc.len()
    );

    store.record_event(&RunEvent::new(
        &report.run_id,
        "run_completed",
        serde_json::to_value(&report.metrics)?,
    ))?;

    // 6. Summary
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Run {}", report.run_id);
    println!("{}", report.metrics.summary());

    if report.metrics.units_failed > 0
        || report.metrics.batches_rejected > 0
        || report.metrics.prunes_failed > 0
    {
        println!("⚠️  Completed with failures");
    } else {
        println!("✅ Import complete");
    }

    Ok(())
}
