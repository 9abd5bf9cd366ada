// Report emission
//
// Serializes validation and reconciliation results to JSON for machine
// consumers and a single self-contained HTML page for humans.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::BudgetlineError;
use crate::reconcile::{ReconStatus, ReconcileReport};
use crate::validation::{Severity, ValidationReport};

#[derive(Debug, Clone, Serialize)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub html: PathBuf,
}

/// Write both report formats into `out_dir`, creating it when needed.
pub fn write_reports(
    out_dir: &Path,
    validation: &ValidationReport,
    reconcile: Option<&ReconcileReport>,
) -> Result<ReportPaths> {
    fs::create_dir_all(out_dir).map_err(|e| BudgetlineError::io(out_dir, e))?;

    let json_path = out_dir.join("validation_report.json");
    write_json(&json_path, &CombinedReport {
        validation,
        reconcile,
    })?;

    let html_path = out_dir.join("validation_report.html");
    let html = render_html(validation, reconcile);
    fs::write(&html_path, html).map_err(|e| BudgetlineError::io(&html_path, e))?;

    info!(dir = %out_dir.display(), "reports written");
    Ok(ReportPaths {
        json: json_path,
        html: html_path,
    })
}

#[derive(Serialize)]
struct CombinedReport<'a> {
    validation: &'a ValidationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    reconcile: Option<&'a ReconcileReport>,
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value).context("serializing report")?;
    fs::write(path, raw).map_err(|e| BudgetlineError::io(path, e))?;
    Ok(())
}

pub fn render_html(
    validation: &ValidationReport,
    reconcile: Option<&ReconcileReport>,
) -> String {
    let mut out = String::with_capacity(8 * 1024);
    out.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
    out.push_str("<title>Budget Data Validation Report</title><style>");
    out.push_str(
        "body{font-family:sans-serif;margin:2rem}table{border-collapse:collapse;width:100%}\
         th,td{border:1px solid #ccc;padding:4px 8px;text-align:left}\
         .error{color:#b00020}.warning{color:#a06000}.info{color:#555}",
    );
    out.push_str("</style></head><body>\n");

    out.push_str(&format!(
        "<h1>Budget Data Validation Report</h1><p>Generated {}</p>\n",
        escape(&validation.generated_at)
    ));
    out.push_str(&format!(
        "<p>{} errors, {} warnings, {} info across {} checks.</p>\n",
        validation.summary.errors,
        validation.summary.warnings,
        validation.summary.infos,
        validation.summary.checks_run
    ));

    out.push_str("<h2>Issues</h2>\n");
    if validation.issues.is_empty() {
        out.push_str("<p>No issues found.</p>\n");
    } else {
        out.push_str("<table><tr><th>Check</th><th>Severity</th><th>Count</th><th>Detail</th></tr>\n");
        for issue in &validation.issues {
            let class = severity_class(issue.severity);
            out.push_str(&format!(
                "<tr><td>{}</td><td class=\"{}\">{}</td><td>{}</td><td>{}</td></tr>\n",
                escape(&issue.check),
                class,
                issue.severity.label(),
                issue.count,
                escape(&issue.detail)
            ));
        }
        out.push_str("</table>\n");
    }

    if let Some(recon) = reconcile {
        out.push_str("<h2>Reconciliation</h2>\n");
        out.push_str(&format!(
            "<p>{} pass, {} mismatch, {} no-data.</p>\n",
            recon.passes, recon.mismatches, recon.no_data
        ));
        if !recon.findings.is_empty() {
            out.push_str(
                "<table><tr><th>Check</th><th>Exhibit</th><th>Organization</th>\
                 <th>Column</th><th>Expected</th><th>Actual</th><th>Status</th></tr>\n",
            );
            for f in &recon.findings {
                let exhibit_name = crate::catalog::ExhibitType::from_key(&f.exhibit)
                    .map(|e| e.name())
                    .unwrap_or(f.exhibit.as_str());
                out.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
                     <td>{}</td><td>{}</td><td>{}</td></tr>\n",
                    escape(&f.check),
                    escape(exhibit_name),
                    escape(f.organization.as_deref().unwrap_or("-")),
                    escape(&f.column),
                    fmt_amount(f.expected),
                    fmt_amount(f.actual),
                    status_label(f.status)
                ));
            }
            out.push_str("</table>\n");
        }
    }

    out.push_str("</body></html>\n");
    out
}

fn severity_class(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    }
}

fn status_label(status: ReconStatus) -> &'static str {
    match status {
        ReconStatus::Pass => "PASS",
        ReconStatus::Mismatch => "MISMATCH",
        ReconStatus::NoData => "NO DATA",
    }
}

fn fmt_amount(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.1}", v),
        None => "-".to_string(),
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{ValidationIssue, ValidationSummary};
    use tempfile::tempdir;

    fn sample_report() -> ValidationReport {
        ValidationReport {
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            issues: vec![ValidationIssue {
                check: "duplicate_rows".to_string(),
                severity: Severity::Error,
                detail: "duplicate natural key <navy_p1.xlsx>".to_string(),
                count: 2,
                sample_rows: Vec::new(),
            }],
            summary: ValidationSummary {
                checks_run: 12,
                errors: 1,
                warnings: 0,
                infos: 0,
            },
            structural_failure: false,
        }
    }

    #[test]
    fn test_html_escapes_and_lists_issues() {
        let html = render_html(&sample_report(), None);
        assert!(html.contains("duplicate_rows"));
        assert!(html.contains("&lt;navy_p1.xlsx&gt;"));
        assert!(html.contains("1 errors, 0 warnings"));
        assert!(!html.contains("<navy_p1.xlsx>"));
    }

    #[test]
    fn test_write_reports_produces_both_files() {
        let tmp = tempdir().unwrap();
        let paths = write_reports(&tmp.path().join("reports"), &sample_report(), None).unwrap();
        assert!(paths.json.is_file());
        assert!(paths.html.is_file());

        let raw = std::fs::read_to_string(&paths.json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["validation"]["summary"]["errors"], 1);
        assert!(parsed.get("reconcile").is_none());
    }
}
