use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use influencer_metrics::report::summarize;
use influencer_metrics::{
    bootstrap, enrich_batch, get_metrics_for_date, read_batch_csv, Connector, MetadataTable,
    Reconciler, ReconcilerConfig, SqliteConnector, TracingSink, WarehouseConfig,
};

const USAGE: &str = "\
usage:
  influencer-metrics apply <rows.csv> [--metadata <metadata.csv>] [--date YYYY-MM-DD]
  influencer-metrics summarize [YYYY-MM-DD]
  influencer-metrics rows <YYYY-MM-DD>

configuration (environment):
  METRICS_DATABASE            database file (required)
  METRICS_TABLE               durable table name
  METRICS_RECENT_WINDOW_SECS  window for updated_rows_recent
  METRICS_BUSY_TIMEOUT_MS     wait for a concurrent run's lock";

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = env::args().skip(1).collect();
    let warehouse = WarehouseConfig::from_env()?;
    let settings = ReconcilerConfig::from_env()?;

    match args.first().map(String::as_str) {
        Some("apply") => run_apply(&args[1..], &warehouse, settings),
        Some("summarize") => run_summarize(&args[1..], &warehouse, &settings),
        Some("rows") => run_rows(&args[1..], &warehouse, &settings),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn parse_day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("'{}' is not a YYYY-MM-DD date", raw))
}

/// Value following `flag`, if present.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Result<Option<&'a str>> {
    match args.iter().position(|a| a == flag) {
        Some(i) => match args.get(i + 1) {
            Some(value) => Ok(Some(value.as_str())),
            None => bail!("{} needs a value", flag),
        },
        None => Ok(None),
    }
}

fn run_apply(args: &[String], warehouse: &WarehouseConfig, settings: ReconcilerConfig) -> Result<()> {
    let Some(rows_path) = args.first() else {
        bail!("apply needs a CSV path\n\n{}", USAGE);
    };
    let interval_date = match flag_value(args, "--date")? {
        Some(raw) => parse_day(raw)?,
        None => Utc::now().date_naive(),
    };

    println!("📂 Loading batch from {}...", rows_path);
    let mut batch = read_batch_csv(Path::new(rows_path))?;
    println!("✓ Loaded {} rows", batch.len());

    if let Some(meta_path) = flag_value(args, "--metadata")? {
        let table = MetadataTable::from_csv(Path::new(meta_path))?;
        let report = enrich_batch(&mut batch, &table, &TracingSink);
        println!(
            "✓ Enriched {} rows ({} lookups failed)",
            report.enriched, report.failed
        );
    }

    let connector = Arc::new(SqliteConnector::from_config(warehouse, &settings));
    let reconciler = Reconciler::new(connector, settings);

    println!("\n💾 Applying batch for {}...", interval_date);
    let outcome = reconciler.apply_batch_on(&batch, interval_date)?;

    println!("✓ Inserted: {}", outcome.summary.rows_inserted);
    println!("✓ Updated: {}", outcome.summary.rows_updated);
    if !outcome.rejected.is_empty() {
        println!("⚠️  Rejected: {}", outcome.rejected.len());
        for rejection in &outcome.rejected {
            println!("   {}", rejection);
        }
    }
    match outcome.totals() {
        Ok(totals) => println!("{}", serde_json::to_string_pretty(totals)?),
        Err(err) => eprintln!("⚠️  Totals unavailable: {}", err),
    }

    Ok(())
}

fn run_summarize(args: &[String], warehouse: &WarehouseConfig, settings: &ReconcilerConfig) -> Result<()> {
    let interval_date = match args.first() {
        Some(raw) => parse_day(raw)?,
        None => Utc::now().date_naive(),
    };

    let conn = SqliteConnector::from_config(warehouse, settings).connect()?;
    bootstrap(&conn, settings.table())?;
    let totals = summarize(
        &conn,
        settings.table(),
        interval_date,
        settings.recent_window,
        Utc::now(),
    )?;

    println!("{}", serde_json::to_string_pretty(&totals)?);
    Ok(())
}

fn run_rows(args: &[String], warehouse: &WarehouseConfig, settings: &ReconcilerConfig) -> Result<()> {
    let Some(raw) = args.first() else {
        bail!("rows needs a date\n\n{}", USAGE);
    };
    let interval_date = parse_day(raw)?;

    let conn = SqliteConnector::from_config(warehouse, settings).connect()?;
    bootstrap(&conn, settings.table())?;
    let records = get_metrics_for_date(&conn, settings.table(), interval_date)?;

    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
