//! ferc-xbrl-extract CLI - extract tabular data from FERC XBRL filings

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use regex::Regex;
use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use ferc_xbrl_extract::extract::{extract, used_fact_ratio, ExtractionOptions, Form, TableCache};
use ferc_xbrl_extract::sink::{CsvDirSink, TableSink, TeeSink, WriteMode};

/// Extract tabular data from FERC XBRL filings
#[derive(Parser)]
#[command(name = "ferc-xbrl-extract")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Filing sources: XBRL files, directories, or zip archives
    #[arg(required = true)]
    filings: Vec<PathBuf>,

    /// Zip archive of taxonomy documents
    #[arg(short, long)]
    taxonomy: PathBuf,

    /// FERC form number (1, 2, 6, 60, 714)
    #[arg(short, long, default_value = "1")]
    form_number: u32,

    /// Directory for output CSV files
    #[arg(short, long, default_value = "ferc-xbrl-out")]
    out_dir: PathBuf,

    /// Mirror output CSV files to a second directory
    #[arg(long)]
    mirror_dir: Option<PathBuf>,

    /// Write the datapackage descriptor to this path
    #[arg(short = 's', long)]
    datapackage_path: Option<PathBuf>,

    /// Write concept metadata to this path
    #[arg(short, long)]
    metadata_path: Option<PathBuf>,

    /// Replace existing output files instead of appending
    #[arg(short, long)]
    clobber: bool,

    /// Number of filings per worker batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Only parse filings whose name matches this regex
    #[arg(long)]
    instance_pattern: Option<String>,

    /// Only extract the named tables
    #[arg(long, num_args = 1..)]
    requested_tables: Option<Vec<String>>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    loglevel: String,

    /// Warn when the fraction of extracted facts falls below this
    #[arg(long, default_value = "0.95")]
    coverage_threshold: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.loglevel).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let form = Form::from_number(cli.form_number)?;

    let mut options = ExtractionOptions::new(cli.filings, cli.taxonomy.clone(), form);
    options.workers = cli.workers;
    options.batch_size = cli.batch_size;
    options.requested_tables = cli
        .requested_tables
        .map(|tables| tables.into_iter().collect::<HashSet<String>>());
    options.instance_pattern = cli
        .instance_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("Invalid instance pattern")?;

    let start = Instant::now();
    let mut cache = TableCache::default();
    let output = extract(&options, &mut cache)
        .with_context(|| format!("Failed to extract from {}", cli.taxonomy.display()))?;

    if let Some(path) = &cli.datapackage_path {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &output.datapackage)?;
    }
    if let Some(path) = &cli.metadata_path {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &output.metadata)?;
    }

    let mode = if cli.clobber {
        WriteMode::Replace
    } else {
        WriteMode::Append
    };
    let mut sink: Box<dyn TableSink> = match &cli.mirror_dir {
        Some(mirror) => Box::new(TeeSink::new(
            CsvDirSink::new(&cli.out_dir)?,
            CsvDirSink::new(mirror)?,
        )),
        None => Box::new(CsvDirSink::new(&cli.out_dir)?),
    };

    let mut tables_written = 0usize;
    let mut rows_written = 0usize;
    for (name, table) in &output.tables {
        if table.is_empty() {
            continue;
        }
        sink.write_table(name, table, mode)?;
        tables_written += 1;
        rows_written += table.len();
    }
    let elapsed = start.elapsed();

    println!(
        "{} {} filings extracted",
        "✓".green().bold(),
        output.stats.len()
    );
    println!("  Tables: {tables_written}");
    println!("  Rows: {rows_written}");
    println!("  Time: {:.2}s", elapsed.as_secs_f64());

    if let Some(ratio) = used_fact_ratio(&output.stats) {
        if ratio < cli.coverage_threshold {
            println!(
                "{} Fact coverage: {:.1}% (below threshold {:.1}%)",
                "!".yellow().bold(),
                ratio * 100.0,
                cli.coverage_threshold * 100.0
            );
        } else {
            println!("  Fact coverage: {:.1}%", ratio * 100.0);
        }
    }

    Ok(())
}
