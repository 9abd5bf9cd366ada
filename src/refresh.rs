// Staged refresh orchestrator
//
// Drives download -> build -> validate -> report -> enrich sequentially.
// Each stage resolves to completed, failed, or skipped; a progress
// snapshot is rewritten after every transition so an external monitor
// can observe a crash mid-run. A pre-build database backup enables
// rollback when build or validation fails. Enrichment failure is
// non-fatal: it is a derived, rebuildable view, not source-of-truth
// state.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::download::{self, DownloadConfig, DownloadTask};
use crate::enrich;
use crate::error::BudgetlineError;
use crate::ingest;
use crate::reconcile::{self, ReconcileConfig, ReconcileReport};
use crate::report;
use crate::validation::{self, Severity, ValidationConfig, ValidationReport};

pub const PROGRESS_FILE: &str = "refresh_progress.json";
pub const BACKUP_SUFFIX: &str = ".backup";

// ============================================================================
// STAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Build,
    Validate,
    Report,
    Enrich,
}

impl Stage {
    pub const ALL: &'static [Stage] = &[
        Stage::Download,
        Stage::Build,
        Stage::Validate,
        Stage::Report,
        Stage::Enrich,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Build => "build",
            Stage::Validate => "validate",
            Stage::Report => "report",
            Stage::Enrich => "enrich",
        }
    }

    pub fn from_key(key: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.key() == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub elapsed_secs: f64,
    pub detail: Option<String>,
}

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub stages: Vec<Stage>,
    pub documents_root: PathBuf,
    pub db_path: PathBuf,
    pub reports_dir: PathBuf,
    pub downloads: Vec<DownloadTask>,
    pub download_config: DownloadConfig,
    pub validation_config: ValidationConfig,
    pub reconcile_config: ReconcileConfig,
    /// Validation issues at or above this severity fail the run.
    pub fail_threshold: Severity,
    pub rebuild: bool,
    pub dry_run: bool,
    pub rollback: bool,
    pub webhook_url: Option<String>,
    /// Directory holding the progress artifact.
    pub work_dir: PathBuf,
    pub stage_timeout: Duration,
}

impl RefreshOptions {
    pub fn new(documents_root: PathBuf, db_path: PathBuf, work_dir: PathBuf) -> RefreshOptions {
        RefreshOptions {
            stages: Stage::ALL.to_vec(),
            documents_root,
            reports_dir: work_dir.join("reports"),
            db_path,
            downloads: Vec::new(),
            download_config: DownloadConfig::default(),
            validation_config: ValidationConfig::default(),
            reconcile_config: ReconcileConfig::default(),
            fail_threshold: Severity::Error,
            rebuild: false,
            dry_run: false,
            rollback: true,
            webhook_url: None,
            work_dir,
            stage_timeout: Duration::from_secs(3600),
        }
    }

    fn progress_path(&self) -> PathBuf {
        self.work_dir.join(PROGRESS_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self
            .db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store.db".to_string());
        name.push_str(BACKUP_SUFFIX);
        self.db_path.with_file_name(name)
    }
}

// ============================================================================
// PROGRESS ARTIFACT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub started_at: String,
    pub current_stage: Option<Stage>,
    pub current_status: Option<StageStatus>,
    pub elapsed_secs: f64,
    pub stages: Vec<StageResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: bool,
    pub elapsed_secs: f64,
    pub stages: Vec<StageResult>,
    pub rollback_performed: bool,
}

struct ProgressWriter {
    path: PathBuf,
    started_at: String,
    start: Instant,
}

impl ProgressWriter {
    fn new(path: PathBuf) -> ProgressWriter {
        ProgressWriter {
            path,
            started_at: Utc::now().to_rfc3339(),
            start: Instant::now(),
        }
    }

    fn write(&self, current: Option<(Stage, StageStatus)>, stages: &[StageResult]) {
        let snapshot = ProgressSnapshot {
            started_at: self.started_at.clone(),
            current_stage: current.map(|(s, _)| s),
            current_status: current.map(|(_, st)| st),
            elapsed_secs: self.start.elapsed().as_secs_f64(),
            stages: stages.to_vec(),
        };
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        // Monitoring must never take the run down.
        match serde_json::to_string_pretty(&snapshot) {
            Ok(raw) => {
                if let Err(e) = fs::write(&self.path, raw) {
                    warn!(path = %self.path.display(), error = %e, "progress write failed");
                }
            }
            Err(e) => warn!(error = %e, "progress serialization failed"),
        }
    }

    fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Run the selected stages. Returns the process exit code: zero on
/// overall success, nonzero on any stage failure or validation above
/// the requested threshold.
pub fn run(opts: &RefreshOptions) -> i32 {
    let summary = run_to_summary(opts);
    notify_webhook(opts, &summary);
    if summary.success {
        0
    } else {
        1
    }
}

pub fn run_to_summary(opts: &RefreshOptions) -> RunSummary {
    let start = Instant::now();
    let progress = ProgressWriter::new(opts.progress_path());
    let mut results: Vec<StageResult> = Vec::new();
    let mut failed_fatally = false;
    let mut rollback_performed = false;
    let mut backup_taken = false;

    let mut validation_report: Option<ValidationReport> = None;
    let mut reconcile_report: Option<ReconcileReport> = None;

    for &stage in Stage::ALL {
        if !opts.stages.contains(&stage) {
            continue;
        }

        if failed_fatally {
            info!(stage = stage.key(), "skipped after earlier failure");
            results.push(StageResult {
                stage,
                status: StageStatus::Skipped,
                elapsed_secs: 0.0,
                detail: Some("earlier stage failed".to_string()),
            });
            progress.write(Some((stage, StageStatus::Skipped)), &results);
            continue;
        }
        // Reporting structurally requires a database.
        if stage == Stage::Report && !opts.dry_run && !opts.db_path.is_file() {
            results.push(StageResult {
                stage,
                status: StageStatus::Skipped,
                elapsed_secs: 0.0,
                detail: Some("database does not exist".to_string()),
            });
            progress.write(Some((stage, StageStatus::Skipped)), &results);
            continue;
        }

        if stage == Stage::Build && !opts.dry_run {
            backup_taken = take_backup(opts);
        }

        info!(stage = stage.key(), "stage starting");
        progress.write(Some((stage, StageStatus::Running)), &results);
        let stage_start = Instant::now();

        let outcome = execute_stage(opts, stage, &mut validation_report, &mut reconcile_report);
        let elapsed = stage_start.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(detail) => {
                info!(stage = stage.key(), elapsed_secs = elapsed, "stage completed");
                StageResult {
                    stage,
                    status: StageStatus::Completed,
                    elapsed_secs: elapsed,
                    detail,
                }
            }
            Err(err) => {
                error!(stage = stage.key(), error = %err, "stage failed");
                if stage == Stage::Enrich {
                    // Derived view; warn and keep the run green.
                    warn!("enrichment failure is non-fatal; view can be rebuilt");
                } else {
                    failed_fatally = true;
                    if matches!(stage, Stage::Build | Stage::Validate) {
                        rollback_performed = maybe_rollback(opts, backup_taken);
                    }
                }
                StageResult {
                    stage,
                    status: StageStatus::Failed,
                    elapsed_secs: elapsed,
                    detail: Some(err.to_string()),
                }
            }
        };
        let status = result.status;
        results.push(result);
        progress.write(Some((stage, status)), &results);
    }

    let success = !failed_fatally;
    if success {
        progress.clear();
    } else {
        progress.write(None, &results);
    }

    RunSummary {
        success,
        elapsed_secs: start.elapsed().as_secs_f64(),
        stages: results,
        rollback_performed,
    }
}

fn execute_stage(
    opts: &RefreshOptions,
    stage: Stage,
    validation_report: &mut Option<ValidationReport>,
    reconcile_report: &mut Option<ReconcileReport>,
) -> Result<Option<String>> {
    match stage {
        Stage::Download => {
            let tasks = opts.downloads.clone();
            let root = opts.work_dir.join("downloads");
            let config = opts.download_config.clone();
            let dry_run = opts.dry_run;
            let summary = with_timeout(opts.stage_timeout, "download", move || {
                download::download(&tasks, &root, &config, dry_run)
            })?;
            Ok(Some(format!(
                "{} fetched, {} failed",
                summary.succeeded, summary.failed
            )))
        }
        Stage::Build => {
            if opts.dry_run {
                info!(root = %opts.documents_root.display(), "dry-run: would build fact store");
                return Ok(Some("dry-run".to_string()));
            }
            let root = opts.documents_root.clone();
            let db_path = opts.db_path.clone();
            let rebuild = opts.rebuild;
            let summary = with_timeout(opts.stage_timeout, "build", move || {
                ingest::build(&root, &db_path, rebuild)
            })?;
            Ok(Some(format!(
                "{} files ingested, {} rows",
                summary.files_ingested, summary.rows_inserted
            )))
        }
        Stage::Validate => {
            if opts.dry_run {
                info!("dry-run: would validate fact store");
                return Ok(Some("dry-run".to_string()));
            }
            let db_path = opts.db_path.clone();
            let config = opts.validation_config.clone();
            let report = with_timeout(opts.stage_timeout, "validate", move || {
                validation::validate(&db_path, &config)
            })?;
            let recon = if report.structural_failure {
                warn!("structural validation failure; reconciliation halted");
                None
            } else {
                let db_path = opts.db_path.clone();
                let config = opts.reconcile_config.clone();
                Some(with_timeout(opts.stage_timeout, "validate", move || {
                    reconcile::reconcile(&db_path, &config)
                })?)
            };

            let passed = report.passes(opts.fail_threshold)
                && recon.as_ref().map_or(true, |r| r.passed());
            let detail = format!(
                "{} errors, {} warnings",
                report.summary.errors, report.summary.warnings
            );
            *validation_report = Some(report);
            *reconcile_report = recon;
            if !passed {
                return Err(
                    BudgetlineError::stage("validate", format!("validation failed: {}", detail))
                        .into(),
                );
            }
            Ok(Some(detail))
        }
        Stage::Report => {
            if opts.dry_run {
                info!("dry-run: would write reports");
                return Ok(Some("dry-run".to_string()));
            }
            let validation = match validation_report {
                Some(report) => report.clone(),
                // Report can run standalone; validate now if it did not.
                None => validation::validate(&opts.db_path, &opts.validation_config)?,
            };
            let paths = report::write_reports(
                &opts.reports_dir,
                &validation,
                reconcile_report.as_ref(),
            )?;
            Ok(Some(format!("{}", paths.json.display())))
        }
        Stage::Enrich => {
            if opts.dry_run {
                info!("dry-run: would enrich fact store");
                return Ok(Some("dry-run".to_string()));
            }
            let db_path = opts.db_path.clone();
            let rebuild = opts.rebuild;
            let summary = with_timeout(opts.stage_timeout, "enrich", move || {
                enrich::enrich(&db_path, rebuild)
            })?;
            Ok(Some(format!(
                "{} elements indexed, {} links",
                summary.elements_indexed, summary.links_detected
            )))
        }
    }
}

/// Hard wall-clock timeout around a stage body. The worker thread is
/// detached on timeout; the stage is simply marked failed.
fn with_timeout<T: Send + 'static>(
    timeout: Duration,
    stage: &str,
    body: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        tx.send(body()).ok();
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(BudgetlineError::stage(
            stage,
            format!("timed out after {}s", timeout.as_secs()),
        )
        .into()),
    }
}

// ============================================================================
// BACKUP / ROLLBACK
// ============================================================================

/// Copy the live database aside immediately before the build stage.
/// Skipped when no prior database exists.
fn take_backup(opts: &RefreshOptions) -> bool {
    if !opts.db_path.is_file() {
        return false;
    }
    let backup = opts.backup_path();
    match fs::copy(&opts.db_path, &backup) {
        Ok(_) => {
            info!(backup = %backup.display(), "pre-build backup taken");
            true
        }
        Err(e) => {
            warn!(error = %e, "backup failed; rollback will be unavailable");
            false
        }
    }
}

fn maybe_rollback(opts: &RefreshOptions, backup_taken: bool) -> bool {
    if !opts.rollback {
        warn!("rollback disabled; leaving database as-is");
        return false;
    }
    if !backup_taken {
        warn!("no backup available to roll back to");
        return false;
    }
    let backup = opts.backup_path();
    match fs::copy(&backup, &opts.db_path) {
        Ok(_) => {
            info!("database restored from pre-build backup");
            true
        }
        Err(e) => {
            error!(error = %e, "rollback failed");
            false
        }
    }
}

// ============================================================================
// WEBHOOK
// ============================================================================

/// POST the run summary to the configured webhook. Delivery failure is
/// logged and never affects the run's own exit code.
fn notify_webhook(opts: &RefreshOptions, summary: &RunSummary) {
    let Some(url) = &opts.webhook_url else { return };
    if opts.dry_run {
        info!(url = %url, "dry-run: would notify webhook");
        return;
    }
    let outcome = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|client| {
            client
                .post(url)
                .json(summary)
                .send()
                .map_err(anyhow::Error::from)
        })
        .and_then(|resp| resp.error_for_status().map_err(anyhow::Error::from));
    match outcome {
        Ok(_) => info!(url = %url, "webhook notified"),
        Err(e) => warn!(url = %url, error = %e, "webhook delivery failed"),
    }
}

// ============================================================================
// SCHEDULING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleInterval {
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleInterval {
    pub fn from_key(key: &str) -> Option<ScheduleInterval> {
        match key {
            "daily" => Some(ScheduleInterval::Daily),
            "weekly" => Some(ScheduleInterval::Weekly),
            "monthly" => Some(ScheduleInterval::Monthly),
            _ => None,
        }
    }
}

/// Next run strictly after `now`: today at the target time when that is
/// still ahead, otherwise advanced by one interval. Recomputing from
/// wall-clock completion rather than the previous target avoids drift.
pub fn next_run_after(
    now: DateTime<Utc>,
    target_time: NaiveTime,
    interval: ScheduleInterval,
) -> DateTime<Utc> {
    let today_target = now
        .date_naive()
        .and_time(target_time)
        .and_utc();
    if today_target > now {
        return today_target;
    }
    match interval {
        ScheduleInterval::Daily => today_target + ChronoDuration::days(1),
        ScheduleInterval::Weekly => today_target + ChronoDuration::days(7),
        ScheduleInterval::Monthly => today_target
            .checked_add_months(Months::new(1))
            .unwrap_or(today_target + ChronoDuration::days(30)),
    }
}

/// Repeating mode: sleep until the target time, run, recompute from
/// completion, forever.
pub fn run_scheduled(
    opts: &RefreshOptions,
    target_time: NaiveTime,
    interval: ScheduleInterval,
) -> ! {
    loop {
        let now = Utc::now();
        let next = next_run_after(now, target_time, interval);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(next = %next.to_rfc3339(), wait_secs = wait.as_secs(), "sleeping until next run");
        std::thread::sleep(wait);
        let code = run(opts);
        info!(exit_code = code, "scheduled run finished");
    }
}

// ============================================================================
// TESTS
// ============================================================================
