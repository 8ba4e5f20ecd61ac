//! `cta`: run backtests over stored bars and inspect live account snapshots.
//!
//! Commands:
//! - `backtest` run the configured strategy over a SQLite bar database
//! - `snapshot` print the latest persisted account snapshot
//! - `validate` load a config file and report problems

mod obs;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use cta_backtest::{open_store, BacktestEngine, BacktestReport, MaRsiStrategy};
use cta_core::{Config, TimestampMs};
use cta_ingestion::SqliteBarSource;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cta", about = "Crypto CTA backtest and accounting tools", version)]
struct Cli {
    /// Default log filter (overridden by CTA_LOG).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format: text or json.
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a backtest over bars stored in SQLite.
    Backtest {
        /// JSON config file. Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// SQLite database holding the `bars` table.
        #[arg(long)]
        db: PathBuf,

        /// Symbol to trade. Defaults to instrument.symbol from the config.
        #[arg(long)]
        symbol: Option<String>,

        /// Inclusive start, RFC 3339 (e.g. 2024-01-01T00:00:00Z).
        #[arg(long)]
        start: String,

        /// Exclusive end, RFC 3339.
        #[arg(long)]
        end: String,

        /// Write the full JSON report here.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the latest stored account snapshot as JSON.
    Snapshot {
        /// JSON config file naming the persistence backend.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a config file.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    obs::init_tracing(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Command::Backtest {
            config,
            db,
            symbol,
            start,
            end,
            out,
        } => run_backtest_cmd(config.as_deref(), &db, symbol, &start, &end, out.as_deref()),
        Command::Snapshot { config } => run_snapshot_cmd(config.as_deref()),
        Command::Validate { config } => {
            load_config(Some(&config))?;
            println!("{}: ok", config.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn parse_ts(raw: &str) -> Result<TimestampMs> {
    let dt = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid RFC 3339 timestamp {raw:?}"))?;
    Ok(dt.with_timezone(&Utc).timestamp_millis())
}

fn run_backtest_cmd(
    config_path: Option<&Path>,
    db: &Path,
    symbol: Option<String>,
    start: &str,
    end: &str,
    out: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let symbol = symbol.unwrap_or_else(|| config.instrument.symbol.clone());
    let start_ms = parse_ts(start)?;
    let end_ms = parse_ts(end)?;

    let source = SqliteBarSource::open(db)
        .with_context(|| format!("opening bar database {}", db.display()))?;
    let strategy_name = config.strategy.name.clone();
    let params = config.strategy.params.clone();
    let mut engine = BacktestEngine::new(config, source)?;

    info!(strategy = %strategy_name, symbol = %symbol, start_ms, end_ms, "starting backtest");
    let report = match strategy_name.as_str() {
        "ma_rsi" => engine.run::<MaRsiStrategy>(&params, &symbol, start_ms, end_ms)?,
        other => bail!("unknown strategy {other:?}"),
    };

    if let Some(path) = out {
        write_report(&report, path)?;
    }
    print_summary(&report);

    if let Some(failure) = &report.failure {
        bail!("backtest failed at {}: {}", failure.ts_ms, failure.reason);
    }
    Ok(())
}

fn write_report(report: &BacktestReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(report)?;
    fs::write(path, body).with_context(|| format!("writing report {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

fn print_summary(report: &BacktestReport) {
    println!(
        "{} on {} ({:?}): {} bars, state {:?}",
        report.strategy, report.symbol, report.interval, report.bars_processed, report.state
    );
    println!("{}", report.statistics);

    let tca = &report.tca.summary;
    if tca.count > 0 {
        println!(
            "TCA: {} fills, mean slippage {:.4}% (adverse {:.4}%), mean latency {:.0} ms",
            tca.count,
            tca.mean_slippage_pct * 100.0,
            tca.mean_adverse_slippage_pct * 100.0,
            tca.mean_latency_ms
        );
    }
}

fn run_snapshot_cmd(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config.persistence)?;
    match store.load()? {
        Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        None => warn!(
            path = %config.persistence.snapshot_path.display(),
            "no snapshot stored"
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ts() {
        assert_eq!(parse_ts("1970-01-01T00:01:00Z").unwrap(), 60_000);
        assert_eq!(parse_ts("1970-01-01T01:00:00+01:00").unwrap(), 0);
        assert!(parse_ts("2024-01-01").is_err());
    }

    #[test]
    fn test_default_config_without_path() {
        let config = load_config(None).unwrap();
        assert_eq!(config.strategy.name, "ma_rsi");
    }
}
