// Document download stage
//
// The one concurrent stage: a bounded pool of worker threads fetches
// independent documents. Workers share no mutable state except the
// per-file manifest entry and the per-host timing samples, both behind
// a mutex. Per-host timeouts adapt to observed response times.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::BudgetlineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub workers: usize,
    /// Timeout for hosts with fewer than three observed samples.
    pub base_timeout_secs: f64,
    pub min_timeout_secs: f64,
    pub max_timeout_secs: f64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            workers: 4,
            base_timeout_secs: 30.0,
            min_timeout_secs: 10.0,
            max_timeout_secs: 120.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub url: String,
    /// Destination path relative to the downloads root.
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub status: String,
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub completed_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub const MANIFEST_FILE: &str = "manifest.json";

// ============================================================================
// ADAPTIVE TIMEOUTS
// ============================================================================

/// Response-time samples per host. The timeout for a host is the 95th
/// percentile of its samples scaled by 1.5 and clamped to
/// [min, max]; hosts with fewer than three samples use the base timeout.
#[derive(Debug, Default)]
pub struct HostTimings {
    samples: HashMap<String, Vec<f64>>,
}

impl HostTimings {
    pub fn record(&mut self, host: &str, elapsed_secs: f64) {
        self.samples.entry(host.to_string()).or_default().push(elapsed_secs);
    }

    pub fn timeout_for(&self, host: &str, config: &DownloadConfig) -> Duration {
        let secs = match self.samples.get(host) {
            Some(samples) if samples.len() >= 3 => {
                let p95 = percentile(samples, 0.95);
                (p95 * 1.5).clamp(config.min_timeout_secs, config.max_timeout_secs)
            }
            _ => config.base_timeout_secs,
        };
        Duration::from_secs_f64(secs)
    }
}

fn percentile(samples: &[f64], p: f64) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn host_of(url: &str) -> String {
    url.splitn(2, "://")
        .nth(1)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("")
        .to_string()
}

// ============================================================================
// POOL
// ============================================================================

/// Fetch every task into `downloads_root` with a bounded worker pool,
/// merging results into the persistent manifest. Dry-run logs the plan
/// and performs no network or filesystem work.
pub fn download(
    tasks: &[DownloadTask],
    downloads_root: &Path,
    config: &DownloadConfig,
    dry_run: bool,
) -> Result<DownloadSummary> {
    let mut summary = DownloadSummary {
        requested: tasks.len(),
        ..Default::default()
    };
    if dry_run {
        for task in tasks {
            info!(url = %task.url, dest = %task.relative_path.display(), "dry-run: would fetch");
        }
        summary.succeeded = tasks.len();
        return Ok(summary);
    }

    fs::create_dir_all(downloads_root)
        .map_err(|e| BudgetlineError::io(downloads_root, e))?;

    let manifest = Arc::new(Mutex::new(load_manifest(downloads_root)?));
    let timings = Arc::new(Mutex::new(HostTimings::default()));
    let (tx, rx) = mpsc::channel::<DownloadTask>();
    let rx = Arc::new(Mutex::new(rx));

    let client = reqwest::blocking::Client::builder()
        .user_agent("budgetline/0.1")
        .build()
        .context("building HTTP client")?;

    let workers = config.workers.max(1).min(tasks.len().max(1));
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let rx = Arc::clone(&rx);
        let manifest = Arc::clone(&manifest);
        let timings = Arc::clone(&timings);
        let client = client.clone();
        let config = config.clone();
        let root = downloads_root.to_path_buf();
        handles.push(std::thread::spawn(move || {
            loop {
                let task = {
                    let guard = rx.lock().expect("task queue poisoned");
                    guard.recv()
                };
                let Ok(task) = task else { break };
                let entry = fetch_one(&client, &task, &root, &config, &timings);
                let key = task.relative_path.to_string_lossy().into_owned();
                manifest.lock().expect("manifest poisoned").insert(key, entry);
            }
        }));
    }

    for task in tasks {
        tx.send(task.clone()).ok();
    }
    drop(tx);
    for handle in handles {
        handle.join().map_err(|_| {
            BudgetlineError::stage("download", "worker thread panicked".to_string())
        })?;
    }

    let manifest = Arc::try_unwrap(manifest)
        .map_err(|_| BudgetlineError::stage("download", "manifest still shared".to_string()))?
        .into_inner()
        .map_err(|_| BudgetlineError::stage("download", "manifest poisoned".to_string()))?;

    for task in tasks {
        let key = task.relative_path.to_string_lossy();
        match manifest.get(key.as_ref()) {
            Some(entry) if entry.status == "ok" => summary.succeeded += 1,
            _ => summary.failed += 1,
        }
    }
    save_manifest(downloads_root, &manifest)?;
    info!(
        requested = summary.requested,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "download stage complete"
    );
    Ok(summary)
}

fn fetch_one(
    client: &reqwest::blocking::Client,
    task: &DownloadTask,
    root: &Path,
    config: &DownloadConfig,
    timings: &Arc<Mutex<HostTimings>>,
) -> ManifestEntry {
    let host = host_of(&task.url);
    let timeout = timings
        .lock()
        .expect("timings poisoned")
        .timeout_for(&host, config);
    let start = Instant::now();

    let result = fetch_body(client, &task.url, timeout);
    let elapsed = start.elapsed().as_secs_f64();
    timings
        .lock()
        .expect("timings poisoned")
        .record(&host, elapsed);

    match result {
        Ok(body) => {
            let dest = root.join(&task.relative_path);
            let write = dest
                .parent()
                .map(fs::create_dir_all)
                .transpose()
                .and_then(|_| fs::write(&dest, &body).map(|_| ()));
            match write {
                Ok(()) => {
                    info!(url = %task.url, bytes = body.len(), "fetched");
                    ManifestEntry {
                        url: task.url.clone(),
                        status: "ok".to_string(),
                        bytes: body.len() as u64,
                        elapsed_secs: elapsed,
                        completed_at: Utc::now().to_rfc3339(),
                    }
                }
                Err(e) => entry_error(task, elapsed, &format!("write failed: {}", e)),
            }
        }
        Err(e) => {
            warn!(url = %task.url, error = %e, "fetch failed");
            entry_error(task, elapsed, &e.to_string())
        }
    }
}

fn fetch_body(
    client: &reqwest::blocking::Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .with_context(|| format!("GET {}", url))?
        .error_for_status()
        .with_context(|| format!("GET {}", url))?;
    let bytes = response.bytes().context("reading response body")?;
    Ok(bytes.to_vec())
}

fn entry_error(task: &DownloadTask, elapsed: f64, reason: &str) -> ManifestEntry {
    ManifestEntry {
        url: task.url.clone(),
        status: format!("error:{}", reason),
        bytes: 0,
        elapsed_secs: elapsed,
        completed_at: Utc::now().to_rfc3339(),
    }
}

// ============================================================================
// MANIFEST
// ============================================================================

pub fn load_manifest(downloads_root: &Path) -> Result<HashMap<String, ManifestEntry>> {
    let path = downloads_root.join(MANIFEST_FILE);
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(&path).map_err(|e| BudgetlineError::io(&path, e))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn save_manifest(downloads_root: &Path, manifest: &HashMap<String, ManifestEntry>) -> Result<()> {
    let path = downloads_root.join(MANIFEST_FILE);
    let raw = serde_json::to_string_pretty(manifest)?;
    fs::write(&path, raw).map_err(|e| BudgetlineError::io(&path, e))?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_timeout_uses_base_below_three_samples() {
        let config = DownloadConfig::default();
        let mut timings = HostTimings::default();
        timings.record("example.mil", 1.0);
        timings.record("example.mil", 2.0);
        assert_eq!(
            timings.timeout_for("example.mil", &config),
            Duration::from_secs_f64(config.base_timeout_secs)
        );
        assert_eq!(
            timings.timeout_for("never-seen.mil", &config),
            Duration::from_secs_f64(config.base_timeout_secs)
        );
    }

    #[test]
    fn test_timeout_scales_p95_and_clamps() {
        let config = DownloadConfig::default();
        let mut timings = HostTimings::default();
        for secs in [10.0, 12.0, 14.0, 16.0, 20.0] {
            timings.record("slow.mil", secs);
        }
        // p95 of 5 samples is the largest; 20 * 1.5 = 30s, inside [10, 120].
        assert_eq!(
            timings.timeout_for("slow.mil", &config),
            Duration::from_secs_f64(30.0)
        );

        let mut fast = HostTimings::default();
        for _ in 0..5 {
            fast.record("fast.mil", 0.1);
        }
        // 0.15s clamps up to the minimum.
        assert_eq!(
            fast.timeout_for("fast.mil", &config),
            Duration::from_secs_f64(config.min_timeout_secs)
        );

        let mut glacial = HostTimings::default();
        for _ in 0..5 {
            glacial.record("glacial.mil", 500.0);
        }
        assert_eq!(
            glacial.timeout_for("glacial.mil", &config),
            Duration::from_secs_f64(config.max_timeout_secs)
        );
    }

    #[test]
    fn test_percentile() {
        let samples: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        assert_eq!(percentile(&samples, 0.95), 95.0);
        assert_eq!(percentile(&samples, 1.0), 100.0);
        assert_eq!(percentile(&[7.0], 0.95), 7.0);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("https://comptroller.defense.gov/budget/fy2025.xlsx"),
            "comptroller.defense.gov"
        );
        assert_eq!(host_of("plain-host/path"), "plain-host");
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("downloads");
        let tasks = vec![DownloadTask {
            url: "https://example.mil/doc.xlsx".to_string(),
            relative_path: PathBuf::from("doc.xlsx"),
        }];
        let summary = download(&tasks, &root, &DownloadConfig::default(), true).unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(!root.exists());
    }

    #[test]
    fn test_manifest_round_trip() {
        let tmp = tempdir().unwrap();
        let mut manifest = HashMap::new();
        manifest.insert(
            "doc.xlsx".to_string(),
            ManifestEntry {
                url: "https://example.mil/doc.xlsx".to_string(),
                status: "ok".to_string(),
                bytes: 42,
                elapsed_secs: 0.5,
                completed_at: "2026-01-01T00:00:00Z".to_string(),
            },
        );
        save_manifest(tmp.path(), &manifest).unwrap();
        let loaded = load_manifest(tmp.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["doc.xlsx"].bytes, 42);
    }

    #[test]
    fn test_failed_fetch_lands_in_manifest_as_error() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("downloads");
        // Unroutable scheme-less URL fails fast without network access.
        let tasks = vec![DownloadTask {
            url: "http://127.0.0.1:1/doc.xlsx".to_string(),
            relative_path: PathBuf::from("doc.xlsx"),
        }];
        let summary = download(&tasks, &root, &DownloadConfig::default(), false).unwrap();
        assert_eq!(summary.failed, 1);
        let manifest = load_manifest(&root).unwrap();
        assert!(manifest["doc.xlsx"].status.starts_with("error:"));
    }
}
