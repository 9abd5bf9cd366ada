// Validation engine
//
// Read-only quality checks over the fact store. Every check yields
// structured issues instead of raising, so one bad record never halts a
// run; pass/fail is decided by the caller's severity threshold.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

use crate::catalog::{self, ExhibitType, FISCAL_YEARS};
use crate::db;
use crate::error::BudgetlineError;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// One finding from one check. Regenerated per run, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub check: String,
    pub severity: Severity,
    pub detail: String,
    /// Offending row count behind this issue.
    pub count: i64,
    pub sample_rows: Vec<String>,
}

impl ValidationIssue {
    fn new(check: &str, severity: Severity, detail: String) -> ValidationIssue {
        ValidationIssue {
            check: check.to_string(),
            severity,
            detail,
            count: 1,
            sample_rows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Zero/null-amount rows escalate from warning to error above this fraction.
    pub zero_fraction_escalation: f64,
    /// Year-over-year multiplicative jump flagged above this ratio.
    pub yoy_ratio: f64,
    /// Minimum acceptable fraction of well-extracted PDF pages.
    pub extraction_quality_floor: f64,
    /// Minimum page text length counted as a usable extraction.
    pub min_page_text_len: usize,
    pub canonical_unit: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            zero_fraction_escalation: 0.25,
            yoy_ratio: 10.0,
            extraction_quality_floor: 0.9,
            min_page_text_len: 200,
            canonical_unit: "thousands".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub checks_run: usize,
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub generated_at: String,
    pub issues: Vec<ValidationIssue>,
    pub summary: ValidationSummary,
    /// Set when a structural check failed; dependent reconciliation halts.
    pub structural_failure: bool,
}

impl ValidationReport {
    /// Pass when no issue reaches the threshold severity.
    pub fn passes(&self, threshold: Severity) -> bool {
        !self.issues.iter().any(|i| i.severity >= threshold)
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ValidationEngine {
    pub config: ValidationConfig,
}

impl Default for ValidationEngine {
    fn default() -> Self {
        ValidationEngine {
            config: ValidationConfig::default(),
        }
    }
}

/// Run all checks against the store at `db_path`.
pub fn validate(db_path: &Path, config: &ValidationConfig) -> Result<ValidationReport> {
    if !db_path.is_file() {
        return Err(BudgetlineError::precondition(format!(
            "database does not exist: {}",
            db_path.display()
        ))
        .into());
    }
    let conn = db::open_database(db_path)?;
    let engine = ValidationEngine {
        config: config.clone(),
    };
    engine.run(&conn)
}

impl ValidationEngine {
    pub fn run(&self, conn: &Connection) -> Result<ValidationReport> {
        let mut issues = Vec::new();
        let mut structural_failure = false;

        let checks: &[(&str, fn(&ValidationEngine, &Connection) -> Result<Vec<ValidationIssue>>)] = &[
            ("schema_completeness", Self::check_schema_completeness),
            ("missing_year_coverage", Self::check_missing_year_coverage),
            ("duplicate_rows", Self::check_duplicate_rows),
            ("zero_amounts", Self::check_zero_amounts),
            ("column_alignment", Self::check_column_alignment),
            ("unknown_exhibit_type", Self::check_unknown_exhibit_type),
            ("ingestion_errors", Self::check_ingestion_errors),
            ("unit_consistency", Self::check_unit_consistency),
            ("empty_files", Self::check_empty_files),
            ("year_over_year_anomaly", Self::check_year_over_year),
            ("referential_integrity", Self::check_referential_integrity),
            ("extraction_quality", Self::check_extraction_quality),
        ];

        for (name, check) in checks {
            let found = check(self, conn).with_context(|| format!("check {}", name))?;
            if *name == "schema_completeness" && !found.is_empty() {
                structural_failure = true;
            }
            issues.extend(found);
        }

        let summary = ValidationSummary {
            checks_run: checks.len(),
            errors: issues.iter().filter(|i| i.severity == Severity::Error).count(),
            warnings: issues
                .iter()
                .filter(|i| i.severity == Severity::Warning)
                .count(),
            infos: issues.iter().filter(|i| i.severity == Severity::Info).count(),
        };
        info!(
            errors = summary.errors,
            warnings = summary.warnings,
            infos = summary.infos,
            "validation complete"
        );
        Ok(ValidationReport {
            generated_at: Utc::now().to_rfc3339(),
            issues,
            summary,
            structural_failure,
        })
    }

    /// Every declared fiscal-year amount column must exist in the fact
    /// table. A miss is structural and halts dependent reconciliation.
    fn check_schema_completeness(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('budget_lines')")?;
        let present: BTreeSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut issues = Vec::new();
        for column in db::all_amount_columns() {
            if !present.contains(&column) {
                issues.push(ValidationIssue::new(
                    "schema_completeness",
                    Severity::Error,
                    format!("expected amount column missing from schema: {}", column),
                ));
            }
        }
        Ok(issues)
    }

    /// An organization whose fiscal-year set is a strict subset of the
    /// union across all organizations is likely missing a year of data.
    fn check_missing_year_coverage(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let mut stmt = conn.prepare(
            "SELECT organization, fiscal_year FROM budget_lines
             WHERE organization IS NOT NULL GROUP BY organization, fiscal_year",
        )?;
        let mut per_org: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u16))
        })?;
        for row in rows {
            let (org, fy) = row?;
            per_org.entry(org).or_default().insert(fy);
        }

        let union: BTreeSet<u16> = per_org.values().flatten().copied().collect();
        let mut issues = Vec::new();
        for (org, years) in &per_org {
            if years.is_subset(&union) && years != &union {
                let missing: Vec<String> = union
                    .difference(years)
                    .map(|fy| fy.to_string())
                    .collect();
                issues.push(ValidationIssue::new(
                    "missing_year_coverage",
                    Severity::Warning,
                    format!("{} missing fiscal years: {}", org, missing.join(", ")),
                ));
            }
        }
        Ok(issues)
    }

    /// Natural-key repeats. One issue per duplicated key, carrying the
    /// repeat count.
    fn check_duplicate_rows(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let mut stmt = conn.prepare(
            "SELECT source_file, exhibit_type, account, line_item, fiscal_year, COUNT(*)
             FROM budget_lines
             GROUP BY source_file, exhibit_type, account, line_item, fiscal_year
             HAVING COUNT(*) > 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut issues = Vec::new();
        for row in rows {
            let (source, exhibit, account, item, fy, count) = row?;
            let mut issue = ValidationIssue::new(
                "duplicate_rows",
                Severity::Error,
                format!(
                    "duplicate natural key ({}, {}, {}, {}, {})",
                    source, exhibit, account, item, fy
                ),
            );
            issue.count = count;
            issues.push(issue);
        }
        Ok(issues)
    }

    /// Rows with every amount column null or zero. Escalates to error
    /// when the fraction of such rows is large.
    fn check_zero_amounts(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM budget_lines", [], |r| r.get(0))?;
        if total == 0 {
            return Ok(Vec::new());
        }
        let predicate = db::all_amount_columns()
            .iter()
            .map(|c| format!("COALESCE({}, 0) = 0", c))
            .collect::<Vec<_>>()
            .join(" AND ");
        let zero: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM budget_lines WHERE {}", predicate),
            [],
            |r| r.get(0),
        )?;
        if zero == 0 {
            return Ok(Vec::new());
        }

        let fraction = zero as f64 / total as f64;
        let severity = if fraction > self.config.zero_fraction_escalation {
            Severity::Error
        } else {
            Severity::Warning
        };
        let mut issue = ValidationIssue::new(
            "zero_amounts",
            severity,
            format!(
                "{} of {} rows ({:.1}%) carry no amount in any fiscal year",
                zero,
                total,
                fraction * 100.0
            ),
        );
        issue.count = zero;
        Ok(vec![issue])
    }

    /// Account populated without organization or the reverse suggests a
    /// shifted header mapping in the source file.
    fn check_column_alignment(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM budget_lines
             WHERE (account != '' AND (organization IS NULL OR organization = ''))
                OR (account = '' AND organization IS NOT NULL AND organization != '')",
            [],
            |r| r.get(0),
        )?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT source_file FROM budget_lines
             WHERE (account != '' AND (organization IS NULL OR organization = ''))
                OR (account = '' AND organization IS NOT NULL AND organization != '')
             GROUP BY source_file LIMIT 5",
        )?;
        let samples: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut issue = ValidationIssue::new(
            "column_alignment",
            Severity::Warning,
            format!("{} rows with account/organization misalignment", count),
        );
        issue.count = count;
        issue.sample_rows = samples;
        Ok(vec![issue])
    }

    fn check_unknown_exhibit_type(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let mut stmt = conn.prepare("SELECT DISTINCT exhibit_type FROM budget_lines")?;
        let keys: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut issues = Vec::new();
        for key in keys {
            if ExhibitType::from_key(&key).is_none() {
                issues.push(ValidationIssue::new(
                    "unknown_exhibit_type",
                    Severity::Info,
                    format!("exhibit type not in catalog: {}", key),
                ));
            }
        }
        Ok(issues)
    }

    fn check_ingestion_errors(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        for record in db::list_ingestion_records(conn)? {
            if record.is_error() {
                issues.push(ValidationIssue::new(
                    "ingestion_errors",
                    Severity::Error,
                    format!("{}: {}", record.file_path, record.status),
                ));
            }
        }
        Ok(issues)
    }

    fn check_unit_consistency(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let mut stmt = conn.prepare(
            "SELECT amount_unit, COUNT(*) FROM budget_lines
             WHERE amount_unit IS NOT NULL AND amount_unit != ?1
             GROUP BY amount_unit",
        )?;
        let rows = stmt.query_map([&self.config.canonical_unit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut issues = Vec::new();
        for row in rows {
            let (unit, count) = row?;
            let mut issue = ValidationIssue::new(
                "unit_consistency",
                Severity::Warning,
                format!(
                    "{} rows in unit '{}' (canonical: '{}')",
                    count, unit, self.config.canonical_unit
                ),
            );
            issue.count = count;
            issues.push(issue);
        }
        Ok(issues)
    }

    fn check_empty_files(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        for record in db::list_ingestion_records(conn)? {
            if record.is_ok() && record.row_count == 0 {
                issues.push(ValidationIssue::new(
                    "empty_files",
                    Severity::Warning,
                    format!("{} ingested cleanly but produced no rows", record.file_path),
                ));
            }
        }
        Ok(issues)
    }

    /// Consecutive fiscal-year totals jumping more than the configured
    /// ratio on one row. New-start programs legitimately spike, hence
    /// warning severity and a configurable ratio.
    fn check_year_over_year(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let columns: Vec<String> = FISCAL_YEARS
            .iter()
            .map(|&fy| catalog::amount_column(fy, "total"))
            .collect();
        let select = columns.join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT source_file, account, line_item, {} FROM budget_lines",
            select
        ))?;
        let rows = stmt.query_map([], |row| {
            let source: String = row.get(0)?;
            let account: String = row.get(1)?;
            let item: String = row.get(2)?;
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(row.get::<_, Option<f64>>(3 + i)?);
            }
            Ok((source, account, item, values))
        })?;

        let mut issues = Vec::new();
        for row in rows {
            let (source, account, item, values) = row?;
            for w in values.windows(2) {
                let (Some(prev), Some(next)) = (w[0], w[1]) else { continue };
                if prev.abs() < f64::EPSILON {
                    continue;
                }
                let ratio = (next / prev).abs();
                if ratio > self.config.yoy_ratio || ratio < 1.0 / self.config.yoy_ratio {
                    let mut issue = ValidationIssue::new(
                        "year_over_year_anomaly",
                        Severity::Warning,
                        format!(
                            "{} {}/{}: {:.1} -> {:.1} exceeds {}x ratio",
                            source, account, item, prev, next, self.config.yoy_ratio
                        ),
                    );
                    issue.sample_rows = vec![format!("{}:{}:{}", source, account, item)];
                    issues.push(issue);
                    break;
                }
            }
        }
        Ok(issues)
    }

    /// Organization and exhibit-type values absent from their reference
    /// lookups. Each lookup is checked only when it has been populated.
    fn check_referential_integrity(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        let org_refs: i64 =
            conn.query_row("SELECT COUNT(*) FROM ref_organizations", [], |r| r.get(0))?;
        if org_refs > 0 {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT organization FROM budget_lines
                 WHERE organization IS NOT NULL
                   AND organization NOT IN (SELECT name FROM ref_organizations)",
            )?;
            let unknown: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            for org in unknown {
                issues.push(ValidationIssue::new(
                    "referential_integrity",
                    Severity::Error,
                    format!("organization not in reference lookup: {}", org),
                ));
            }
        }

        let exhibit_refs: i64 =
            conn.query_row("SELECT COUNT(*) FROM ref_exhibit_types", [], |r| r.get(0))?;
        if exhibit_refs > 0 {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT exhibit_type FROM budget_lines
                 WHERE exhibit_type NOT IN (SELECT key FROM ref_exhibit_types)",
            )?;
            let unknown: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            for exhibit in unknown {
                issues.push(ValidationIssue::new(
                    "referential_integrity",
                    Severity::Error,
                    format!("exhibit type not in reference lookup: {}", exhibit),
                ));
            }
        }

        Ok(issues)
    }

    /// Fraction of PDF pages with usable text, and a table payload when
    /// a table was detected.
    fn check_extraction_quality(&self, conn: &Connection) -> Result<Vec<ValidationIssue>> {
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM document_pages", [], |r| r.get(0))?;
        if total == 0 {
            return Ok(Vec::new());
        }
        let good: i64 = conn.query_row(
            "SELECT COUNT(*) FROM document_pages
             WHERE LENGTH(text) >= ?1
               AND (has_table = 0 OR (table_payload IS NOT NULL AND table_payload != ''))",
            [self.config.min_page_text_len as i64],
            |r| r.get(0),
        )?;
        let fraction = good as f64 / total as f64;
        if fraction >= self.config.extraction_quality_floor {
            return Ok(Vec::new());
        }
        let mut issue = ValidationIssue::new(
            "extraction_quality",
            Severity::Warning,
            format!(
                "{:.1}% of {} pages extracted cleanly (floor {:.0}%)",
                fraction * 100.0,
                total,
                self.config.extraction_quality_floor * 100.0
            ),
        );
        issue.count = total - good;
        Ok(vec![issue])
    }
}

// ============================================================================
// TESTS
// ============================================================================
