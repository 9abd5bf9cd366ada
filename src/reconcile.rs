// Reconciliation engine
//
// Two numeric cross-checks over the fact store, independent of the
// per-row validation checks: cross-service (service sums against the
// comptroller aggregator) and cross-exhibit (summary exhibits against
// their detail counterparts). Read-only; "no data" is reported as its
// own status rather than conflated with a mismatch.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

use crate::catalog::{self, ExhibitType, FISCAL_YEARS, RECONCILE_PAIRS};
use crate::db;
use crate::error::BudgetlineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconStatus {
    Pass,
    Mismatch,
    /// One side has no ingested data yet.
    NoData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconFinding {
    pub check: String,
    pub exhibit: String,
    pub organization: Option<String>,
    pub column: String,
    pub expected: Option<f64>,
    pub actual: Option<f64>,
    pub delta_pct: Option<f64>,
    pub status: ReconStatus,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Relative tolerance for a PASS, as a fraction of the expected total.
    pub tolerance: f64,
    /// Source treated as the authoritative aggregator for cross-service
    /// comparison; its rows are excluded from the service sum.
    pub aggregator: ExhibitType,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            tolerance: 0.01,
            aggregator: ExhibitType::ComptrollerSummary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub generated_at: String,
    pub findings: Vec<ReconFinding>,
    pub passes: usize,
    pub mismatches: usize,
    pub no_data: usize,
}

impl ReconcileReport {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }
}

pub struct ReconciliationEngine {
    pub config: ReconcileConfig,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        ReconciliationEngine {
            config: ReconcileConfig::default(),
        }
    }
}

/// Reconcile the store at `db_path`. Fails fast when the database or a
/// required amount column is structurally absent.
pub fn reconcile(db_path: &Path, config: &ReconcileConfig) -> Result<ReconcileReport> {
    if !db_path.is_file() {
        return Err(BudgetlineError::precondition(format!(
            "database does not exist: {}",
            db_path.display()
        ))
        .into());
    }
    let conn = db::open_database(db_path)?;
    let engine = ReconciliationEngine {
        config: config.clone(),
    };
    engine.run(&conn)
}

impl ReconciliationEngine {
    pub fn run(&self, conn: &Connection) -> Result<ReconcileReport> {
        self.require_schema(conn)?;

        let mut findings = Vec::new();
        findings.extend(self.cross_service(conn).context("cross-service check")?);
        findings.extend(self.cross_exhibit(conn).context("cross-exhibit check")?);

        let passes = findings.iter().filter(|f| f.status == ReconStatus::Pass).count();
        let mismatches = findings
            .iter()
            .filter(|f| f.status == ReconStatus::Mismatch)
            .count();
        let no_data = findings
            .iter()
            .filter(|f| f.status == ReconStatus::NoData)
            .count();
        info!(passes, mismatches, no_data, "reconciliation complete");

        Ok(ReconcileReport {
            generated_at: Utc::now().to_rfc3339(),
            findings,
            passes,
            mismatches,
            no_data,
        })
    }

    /// Reconciliation depends on the full fiscal-year column set; a
    /// missing column is structural, not a data mismatch.
    fn require_schema(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('budget_lines')")?;
        let present: BTreeSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        for column in db::all_amount_columns() {
            if !present.contains(&column) {
                return Err(BudgetlineError::stage(
                    "reconcile",
                    format!("amount column missing from schema: {}", column),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Sum every service's total for each summary exhibit type and
    /// compare against the aggregator's own reported total.
    fn cross_service(&self, conn: &Connection) -> Result<Vec<ReconFinding>> {
        let mut findings = Vec::new();
        let summaries: Vec<ExhibitType> = RECONCILE_PAIRS.iter().map(|&(s, _)| s).collect();

        for summary in summaries {
            for &fy in FISCAL_YEARS {
                let column = catalog::amount_column(fy, "total");
                let service_sum = sum_for_exhibit(conn, summary, &column)?;
                let aggregator_total = sum_for_exhibit(conn, self.config.aggregator, &column)?;
                // Skip years nobody reports at all.
                if service_sum.is_none() && aggregator_total.is_none() {
                    continue;
                }
                findings.push(self.compare(
                    "cross_service",
                    summary.key(),
                    None,
                    &column,
                    aggregator_total,
                    service_sum,
                ));
            }
        }
        Ok(findings)
    }

    /// Per organization: summary exhibit total against the sum of its
    /// detail-exhibit rows.
    fn cross_exhibit(&self, conn: &Connection) -> Result<Vec<ReconFinding>> {
        let mut findings = Vec::new();

        for &(summary, detail) in RECONCILE_PAIRS {
            let organizations = organizations_for(conn, &[summary, detail])?;
            for org in organizations {
                for &fy in FISCAL_YEARS {
                    let column = catalog::amount_column(fy, "total");
                    let summary_total = sum_for_exhibit_org(conn, summary, &org, &column)?;
                    let detail_sum = sum_for_exhibit_org(conn, detail, &org, &column)?;
                    if summary_total.is_none() && detail_sum.is_none() {
                        continue;
                    }
                    let mut finding = self.compare(
                        "cross_exhibit",
                        summary.key(),
                        Some(org.clone()),
                        &column,
                        summary_total,
                        detail_sum,
                    );
                    if finding.status == ReconStatus::NoData {
                        finding.note = if summary_total.is_none() {
                            format!("no {} data ingested yet", summary.key())
                        } else {
                            format!("no {} data ingested yet", detail.key())
                        };
                    }
                    findings.push(finding);
                }
            }
        }
        Ok(findings)
    }

    fn compare(
        &self,
        check: &str,
        exhibit: &str,
        organization: Option<String>,
        column: &str,
        expected: Option<f64>,
        actual: Option<f64>,
    ) -> ReconFinding {
        let (status, delta_pct, note) = match (expected, actual) {
            (Some(exp), Some(act)) => {
                let delta = if exp.abs() < f64::EPSILON {
                    if act.abs() < f64::EPSILON { 0.0 } else { f64::INFINITY }
                } else {
                    ((act - exp) / exp).abs()
                };
                if delta <= self.config.tolerance {
                    (ReconStatus::Pass, Some(delta * 100.0), String::new())
                } else {
                    (
                        ReconStatus::Mismatch,
                        Some(delta * 100.0),
                        format!(
                            "delta {:.1}% exceeds {:.1}% tolerance",
                            delta * 100.0,
                            self.config.tolerance * 100.0
                        ),
                    )
                }
            }
            _ => (ReconStatus::NoData, None, "one side has no ingested data".to_string()),
        };

        ReconFinding {
            check: check.to_string(),
            exhibit: exhibit.to_string(),
            organization,
            column: column.to_string(),
            expected,
            actual,
            delta_pct,
            status,
            note,
        }
    }
}

/// SUM of one amount column over an exhibit type; None when no rows
/// carry a value, so "no data" stays distinguishable from a zero total.
fn sum_for_exhibit(conn: &Connection, exhibit: ExhibitType, column: &str) -> Result<Option<f64>> {
    let sum: Option<f64> = conn
        .query_row(
            &format!(
                "SELECT SUM({}) FROM budget_lines WHERE exhibit_type = ?1",
                column
            ),
            params![exhibit.key()],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(sum)
}

fn sum_for_exhibit_org(
    conn: &Connection,
    exhibit: ExhibitType,
    organization: &str,
    column: &str,
) -> Result<Option<f64>> {
    let sum: Option<f64> = conn
        .query_row(
            &format!(
                "SELECT SUM({}) FROM budget_lines
                 WHERE exhibit_type = ?1 AND organization = ?2",
                column
            ),
            params![exhibit.key(), organization],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(sum)
}

fn organizations_for(conn: &Connection, exhibits: &[ExhibitType]) -> Result<Vec<String>> {
    let mut orgs = BTreeSet::new();
    for exhibit in exhibits {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT organization FROM budget_lines
             WHERE exhibit_type = ?1 AND organization IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![exhibit.key()], |row| row.get::<_, String>(0))?;
        for row in rows {
            orgs.insert(row?);
        }
    }
    Ok(orgs.into_iter().collect())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{memory_db, test_line};

    fn service_line(org: &str, total: f64) -> db::BudgetLine {
        let mut line = test_line(&format!("{}_p1.xlsx", org.to_lowercase()), "1506N", "0101", total);
        line.organization = Some(org.to_string());
        line
    }

    fn aggregator_line(total: f64) -> db::BudgetLine {
        let mut line = test_line("comptroller.xlsx", "9999D", "0001", total);
        line.exhibit_type = ExhibitType::ComptrollerSummary.key().to_string();
        line.organization = Some("Comptroller".to_string());
        line
    }

    fn run(conn: &Connection) -> ReconcileReport {
        ReconciliationEngine::default().run(conn).unwrap()
    }

    #[test]
    fn test_cross_service_exact_match_passes() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[
                service_line("Navy", 100.0),
                service_line("Army", 200.0),
                aggregator_line(300.0),
            ],
        )
        .unwrap();

        let report = run(&conn);
        let finding = report
            .findings
            .iter()
            .find(|f| f.check == "cross_service" && f.exhibit == "procurement-summary")
            .unwrap();
        assert_eq!(finding.status, ReconStatus::Pass);
        assert_eq!(finding.delta_pct, Some(0.0));
        assert!(report.passed());
    }

    #[test]
    fn test_cross_service_twenty_percent_mismatch() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[
                service_line("Navy", 100.0),
                service_line("Army", 200.0),
                aggregator_line(250.0),
            ],
        )
        .unwrap();

        let report = run(&conn);
        let finding = report
            .findings
            .iter()
            .find(|f| f.check == "cross_service" && f.exhibit == "procurement-summary")
            .unwrap();
        assert_eq!(finding.status, ReconStatus::Mismatch);
        let delta = finding.delta_pct.unwrap();
        assert!((delta - 20.0).abs() < 1e-9);
        assert!(!report.passed());
    }

    #[test]
    fn test_within_tolerance_passes() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[service_line("Navy", 299.0), aggregator_line(300.0)],
        )
        .unwrap();

        // 1/300 = 0.33% is inside the 1% default tolerance.
        let report = run(&conn);
        let finding = report
            .findings
            .iter()
            .find(|f| f.check == "cross_service")
            .unwrap();
        assert_eq!(finding.status, ReconStatus::Pass);
    }

    #[test]
    fn test_cross_exhibit_no_data_is_not_mismatch() {
        let mut conn = memory_db();
        // Summary rows only; the detail exhibit has nothing ingested.
        db::insert_budget_lines(&mut conn, &[service_line("Navy", 100.0)]).unwrap();

        let report = run(&conn);
        let finding = report
            .findings
            .iter()
            .find(|f| f.check == "cross_exhibit")
            .unwrap();
        assert_eq!(finding.status, ReconStatus::NoData);
        assert!(finding.note.contains("procurement-detail"));
        assert!(report.passed());
    }

    #[test]
    fn test_cross_exhibit_detail_rollup() {
        let mut conn = memory_db();
        let mut detail_a = service_line("Navy", 60.0);
        detail_a.exhibit_type = ExhibitType::ProcurementDetail.key().to_string();
        detail_a.line_item = "0101".to_string();
        let mut detail_b = service_line("Navy", 40.0);
        detail_b.exhibit_type = ExhibitType::ProcurementDetail.key().to_string();
        detail_b.line_item = "0102".to_string();
        db::insert_budget_lines(
            &mut conn,
            &[service_line("Navy", 100.0), detail_a, detail_b],
        )
        .unwrap();

        let report = run(&conn);
        let finding = report
            .findings
            .iter()
            .find(|f| f.check == "cross_exhibit" && f.organization.as_deref() == Some("Navy"))
            .unwrap();
        assert_eq!(finding.status, ReconStatus::Pass);
        assert_eq!(finding.expected, Some(100.0));
        assert_eq!(finding.actual, Some(100.0));
    }

    #[test]
    fn test_empty_store_reports_nothing() {
        let conn = memory_db();
        let report = run(&conn);
        assert!(report.findings.is_empty());
        assert!(report.passed());
    }
}
