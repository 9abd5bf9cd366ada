use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use budgetline::{
    classify, db, enrich, error, ingest, reconcile, refresh, report, validation,
};
use budgetline::{ReconcileConfig, RefreshOptions, Severity, Stage, ValidationConfig};

#[derive(Parser)]
#[command(name = "budgetline", version, about = "Budget document ingestion and validation")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database path
    #[arg(long, global = true, env = "BUDGETLINE_DB", default_value = "budgetline.db")]
    db: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a documents tree into the fact store
    Build {
        /// Root of the classified documents tree
        documents_root: PathBuf,
        /// Recreate all tables and re-ingest every file
        #[arg(long)]
        rebuild: bool,
    },
    /// Run read-only quality checks against the fact store
    Validate(ValidateArgs),
    /// Cross-service and cross-exhibit total reconciliation
    Reconcile {
        /// Relative tolerance for a PASS
        #[arg(long, default_value_t = 0.01)]
        tolerance: f64,
    },
    /// Build derived program-element index, tags, and lineage links
    Enrich {
        /// Clear and regenerate all enrichment tables
        #[arg(long)]
        rebuild: bool,
    },
    /// Full-text search over fact rows and document pages
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Move documents into the classified directory layout
    MigrateLayout {
        documents_root: PathBuf,
        /// Report moves without performing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Staged refresh: download, build, validate, report, enrich
    Refresh(RefreshArgs),
}

#[derive(Args)]
struct ValidateArgs {
    /// Severity at or above which the run fails: info, warning, error
    #[arg(long, default_value = "error")]
    fail_on: String,
    /// Directory for JSON/HTML reports; skipped when absent
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RefreshArgs {
    documents_root: PathBuf,
    /// Working directory for progress, downloads, and reports
    #[arg(long, default_value = "refresh-work")]
    work_dir: PathBuf,
    /// Comma-separated subset of download,build,validate,report,enrich
    #[arg(long)]
    stages: Option<String>,
    #[arg(long)]
    rebuild: bool,
    /// Exercise control flow without side effects
    #[arg(long)]
    dry_run: bool,
    /// Leave the database as-is when build or validation fails
    #[arg(long)]
    no_rollback: bool,
    /// POST a JSON run summary here after completion
    #[arg(long)]
    webhook_url: Option<String>,
    /// Repeat at this wall-clock time, HH:MM
    #[arg(long)]
    at: Option<String>,
    /// Repeat interval: daily, weekly, monthly
    #[arg(long, default_value = "daily")]
    every: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            if error::is_precondition(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Build {
            documents_root,
            rebuild,
        } => {
            let summary = ingest::build(&documents_root, &cli.db, rebuild)?;
            println!("Build complete in {:.1}s", summary.elapsed_secs);
            println!("  files seen:     {}", summary.files_seen);
            println!("  files ingested: {}", summary.files_ingested);
            println!("  files skipped:  {}", summary.files_skipped);
            println!("  files errored:  {}", summary.files_errored);
            println!("  rows inserted:  {}", summary.rows_inserted);
            println!("  pages inserted: {}", summary.pages_inserted);
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate(args) => {
            let threshold = parse_severity(&args.fail_on)?;
            let config = ValidationConfig::default();
            let report = validation::validate(&cli.db, &config)?;

            for issue in &report.issues {
                println!(
                    "[{}] {}: {}",
                    issue.severity.label(),
                    issue.check,
                    issue.detail
                );
            }
            println!(
                "{} errors, {} warnings, {} info across {} checks",
                report.summary.errors,
                report.summary.warnings,
                report.summary.infos,
                report.summary.checks_run
            );
            if let Some(dir) = &args.reports_dir {
                let paths = report::write_reports(dir, &report, None)?;
                println!("reports: {}", paths.json.display());
            }
            if report.passes(threshold) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Reconcile { tolerance } => {
            let config = ReconcileConfig {
                tolerance,
                ..Default::default()
            };
            let recon = reconcile::reconcile(&cli.db, &config)?;
            for f in &recon.findings {
                println!(
                    "{:<14} {:<22} {:<12} {:<22} {:?}  {}",
                    f.check,
                    f.exhibit,
                    f.organization.as_deref().unwrap_or("-"),
                    f.column,
                    f.status,
                    f.note
                );
            }
            println!(
                "{} pass, {} mismatch, {} no-data",
                recon.passes, recon.mismatches, recon.no_data
            );
            if recon.passed() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Enrich { rebuild } => {
            let summary = enrich::enrich(&cli.db, rebuild)?;
            println!("Enrichment complete");
            println!("  elements indexed:   {}", summary.elements_indexed);
            println!("  tags created:       {}", summary.tags_created);
            println!("  descriptions mined: {}", summary.descriptions_mined);
            println!("  links detected:     {}", summary.links_detected);
            println!(
                "  index misses: {:.1}%  described: {:.1}%",
                summary.index_miss_fraction * 100.0,
                summary.described_fraction * 100.0
            );
            if summary.zero_tags {
                println!("  warning: no tags were produced");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Search { query, limit } => {
            let conn = db::open_database(&cli.db)?;
            let lines = db::search_lines(&conn, &query, limit)?;
            for line in &lines {
                println!(
                    "{} | {} | {} {} | {}",
                    line.exhibit_type,
                    line.organization.as_deref().unwrap_or("-"),
                    line.account,
                    line.line_item,
                    line.line_item_title.as_deref().unwrap_or("")
                );
            }
            let pages = db::search_pages(&conn, &query, limit)?;
            for page in &pages {
                println!("{} p.{}", page.source_file, page.page_number);
            }
            println!("{} fact rows, {} pages", lines.len(), pages.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::MigrateLayout {
            documents_root,
            dry_run,
        } => {
            let summary = classify::migrate_layout(&documents_root, dry_run)?;
            println!(
                "{} moved, {} already placed, {} unclassifiable{}",
                summary.moved,
                summary.already_placed,
                summary.unclassifiable,
                if dry_run { " (dry run)" } else { "" }
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Refresh(args) => {
            let mut opts = RefreshOptions::new(args.documents_root, cli.db, args.work_dir);
            if let Some(raw) = &args.stages {
                opts.stages = parse_stages(raw)?;
            }
            opts.rebuild = args.rebuild;
            opts.dry_run = args.dry_run;
            opts.rollback = !args.no_rollback;
            opts.webhook_url = args.webhook_url;

            if let Some(at) = &args.at {
                let target = parse_time(at)?;
                let interval = refresh::ScheduleInterval::from_key(&args.every)
                    .ok_or_else(|| anyhow::anyhow!("unknown interval: {}", args.every))?;
                refresh::run_scheduled(&opts, target, interval);
            }
            let code = refresh::run(&opts);
            Ok(ExitCode::from(code as u8))
        }
    }
}

fn parse_severity(raw: &str) -> Result<Severity> {
    match raw {
        "info" => Ok(Severity::Info),
        "warning" => Ok(Severity::Warning),
        "error" => Ok(Severity::Error),
        other => anyhow::bail!("unknown severity: {}", other),
    }
}

fn parse_stages(raw: &str) -> Result<Vec<Stage>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| Stage::from_key(s).ok_or_else(|| anyhow::anyhow!("unknown stage: {}", s)))
        .collect()
}

fn parse_time(raw: &str) -> Result<chrono::NaiveTime> {
    chrono::NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| anyhow::anyhow!("expected HH:MM, got {}", raw))
}
