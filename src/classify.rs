// Source file classification
//
// The documents root is organized fiscal year -> budget cycle -> source
// category -> exhibit category. Classification reads both the directory
// components and the filename, so files dropped into an old flat layout
// still classify; migrate_layout moves those into the tree.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::catalog::ExhibitType;

// ============================================================================
// CLASSIFICATION TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    Spreadsheet,
    Pdf,
}

impl DocumentKind {
    pub fn from_extension(path: &Path) -> Option<DocumentKind> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "csv" | "xlsx" | "xls" => Some(DocumentKind::Spreadsheet),
            "pdf" => Some(DocumentKind::Pdf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetCycle {
    /// President's budget base request
    BaseRequest,
    /// Congressionally enacted figures
    Enacted,
    /// Supplemental / reconciliation submission
    Reconciliation,
}

impl BudgetCycle {
    pub fn key(&self) -> &'static str {
        match self {
            BudgetCycle::BaseRequest => "base-request",
            BudgetCycle::Enacted => "enacted",
            BudgetCycle::Reconciliation => "reconciliation",
        }
    }

    fn from_token(token: &str) -> Option<BudgetCycle> {
        match token {
            "base-request" | "base" | "pb" | "request" => Some(BudgetCycle::BaseRequest),
            "enacted" => Some(BudgetCycle::Enacted),
            "reconciliation" | "supplemental" | "supp" => Some(BudgetCycle::Reconciliation),
            _ => None,
        }
    }
}

/// A discovered source file with its path-derived classification.
/// Immutable once discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub fiscal_year: Option<u16>,
    pub cycle: Option<BudgetCycle>,
    /// Source category: service or agency directory name (e.g. "navy").
    pub source_category: Option<String>,
    pub exhibit: Option<ExhibitType>,
}

impl SourceFile {
    /// Path string used as the ingestion-state key.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

const SOURCE_CATEGORIES: &[&str] = &[
    "army",
    "navy",
    "air-force",
    "marine-corps",
    "space-force",
    "defense-wide",
    "comptroller",
];

/// Classify a file from its path components and filename.
///
/// Returns None for unsupported extensions. Missing components stay None;
/// ingestion treats a file with no resolvable exhibit type as an error at
/// the file boundary, not a discovery failure.
pub fn classify_path(documents_root: &Path, path: &Path) -> Option<SourceFile> {
    let kind = DocumentKind::from_extension(path)?;

    let relative = path.strip_prefix(documents_root).unwrap_or(path);
    let tokens: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect();

    let mut fiscal_year = None;
    let mut cycle = None;
    let mut source_category = None;

    for token in &tokens {
        if fiscal_year.is_none() {
            fiscal_year = parse_fiscal_year(token);
        }
        if cycle.is_none() {
            cycle = BudgetCycle::from_token(token);
        }
        if source_category.is_none() && SOURCE_CATEGORIES.contains(&token.as_str()) {
            source_category = Some(token.clone());
        }
    }

    let filename = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    // Filename can carry the fiscal year too ("navy_p1_fy2025.xlsx").
    if fiscal_year.is_none() {
        for piece in filename.split(['_', '-', ' ', '.']) {
            if let Some(fy) = parse_fiscal_year(piece) {
                fiscal_year = Some(fy);
                break;
            }
        }
    }

    let exhibit = classify_exhibit(&filename, &tokens);

    Some(SourceFile {
        path: path.to_path_buf(),
        kind,
        fiscal_year,
        cycle,
        source_category,
        exhibit,
    })
}

/// "fy2025", "fy25", "2025" -> 2025. Bare two-digit years are assumed to
/// live in the 2000s.
pub(crate) fn parse_fiscal_year(token: &str) -> Option<u16> {
    let digits = token.strip_prefix("fy").unwrap_or(token);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        4 => {
            let year: u16 = digits.parse().ok()?;
            (1990..=2099).contains(&year).then_some(year)
        }
        2 => {
            let year: u16 = digits.parse().ok()?;
            Some(2000 + year)
        }
        _ => None,
    }
}

/// Resolve the exhibit type from filename tokens, falling back to the
/// exhibit-category directory name.
fn classify_exhibit(filename: &str, path_tokens: &[String]) -> Option<ExhibitType> {
    let exhibit_from = |text: &str| -> Option<ExhibitType> {
        // Short exhibit codes only count as whole tokens; "custom" must
        // not read as an O&M document via its "om" substring.
        let code = |c: &str| {
            text.split(|ch: char| !ch.is_ascii_alphanumeric())
                .any(|tok| tok == c)
        };
        let joined = text.replace(['-', '_', ' '], "");
        if joined.contains("comptroller") || joined.contains("rollup") {
            return Some(ExhibitType::ComptrollerSummary);
        }
        if code("p40") || joined.contains("procurementdetail") {
            return Some(ExhibitType::ProcurementDetail);
        }
        if code("p1") || joined.contains("procurement") {
            return Some(ExhibitType::ProcurementSummary);
        }
        if code("r2") || joined.contains("rdtedetail") {
            return Some(ExhibitType::RdteDetail);
        }
        if code("r1") || joined.contains("rdte") {
            return Some(ExhibitType::RdteSummary);
        }
        if code("o1") || code("om") || joined.contains("maintenance") {
            return Some(ExhibitType::OperationMaintenance);
        }
        if code("m1") || joined.contains("milpers") || joined.contains("personnel") {
            return Some(ExhibitType::PersonnelSummary);
        }
        None
    };

    if let Some(e) = exhibit_from(filename) {
        return Some(e);
    }
    // Directory components closest to the file win.
    path_tokens.iter().rev().find_map(|t| exhibit_from(t))
}

/// Canonical directory for a classified file under the documents root.
pub fn classified_dir(root: &Path, file: &SourceFile) -> Option<PathBuf> {
    let fy = file.fiscal_year?;
    let cycle = file.cycle.unwrap_or(BudgetCycle::BaseRequest);
    let category = file.source_category.as_deref().unwrap_or("unclassified");
    let exhibit = file.exhibit.map(|e| e.key()).unwrap_or("unclassified");
    Some(
        root.join(format!("fy{}", fy))
            .join(cycle.key())
            .join(category)
            .join(exhibit),
    )
}

// ============================================================================
// LAYOUT MIGRATION
// ============================================================================

#[derive(Debug, Default, Serialize)]
pub struct MigrationSummary {
    pub moved: usize,
    pub already_placed: usize,
    pub unclassifiable: usize,
}

/// Move files from the old flat layout into the classified tree. Files
/// whose fiscal year cannot be determined stay put and are counted as
/// unclassifiable. Dry-run reports what would move without touching disk.
pub fn migrate_layout(documents_root: &Path, dry_run: bool) -> Result<MigrationSummary> {
    let mut summary = MigrationSummary::default();

    // Snapshot the tree before moving anything so renames cannot be
    // revisited mid-walk.
    let files: Vec<PathBuf> = walkdir::WalkDir::new(documents_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    for path in &files {
        let path = path.as_path();
        let Some(file) = classify_path(documents_root, path) else {
            continue;
        };
        let Some(target_dir) = classified_dir(documents_root, &file) else {
            summary.unclassifiable += 1;
            debug!(path = %path.display(), "no fiscal year; leaving in place");
            continue;
        };

        if path.parent() == Some(target_dir.as_path()) {
            summary.already_placed += 1;
            continue;
        }

        let target = target_dir.join(path.file_name().unwrap_or_default());
        info!(from = %path.display(), to = %target.display(), dry_run, "migrating");
        if !dry_run {
            fs::create_dir_all(&target_dir)
                .with_context(|| format!("creating {}", target_dir.display()))?;
            fs::rename(path, &target)
                .with_context(|| format!("moving {}", path.display()))?;
        }
        summary.moved += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_full_layout() {
        let root = Path::new("/docs");
        let file = classify_path(
            root,
            Path::new("/docs/fy2025/base-request/navy/procurement-summary/navy_p1.xlsx"),
        )
        .unwrap();

        assert_eq!(file.kind, DocumentKind::Spreadsheet);
        assert_eq!(file.fiscal_year, Some(2025));
        assert_eq!(file.cycle, Some(BudgetCycle::BaseRequest));
        assert_eq!(file.source_category.as_deref(), Some("navy"));
        assert_eq!(file.exhibit, Some(ExhibitType::ProcurementSummary));
    }

    #[test]
    fn test_classify_flat_filename() {
        let root = Path::new("/docs");
        let file =
            classify_path(root, Path::new("/docs/army_r2_fy24_enacted.pdf")).unwrap();
        assert_eq!(file.kind, DocumentKind::Pdf);
        assert_eq!(file.fiscal_year, Some(2024));
        assert_eq!(file.exhibit, Some(ExhibitType::RdteDetail));
    }

    #[test]
    fn test_unsupported_extension() {
        let root = Path::new("/docs");
        assert!(classify_path(root, Path::new("/docs/readme.txt")).is_none());
    }

    #[test]
    fn test_fiscal_year_forms() {
        assert_eq!(parse_fiscal_year("fy2025"), Some(2025));
        assert_eq!(parse_fiscal_year("fy25"), Some(2025));
        assert_eq!(parse_fiscal_year("2025"), Some(2025));
        assert_eq!(parse_fiscal_year("025"), None);
        assert_eq!(parse_fiscal_year("fy20251"), None);
        assert_eq!(parse_fiscal_year("p1"), None);
    }

    #[test]
    fn test_exhibit_detail_beats_summary() {
        // "p40" must not be eaten by the shorter "p1" test.
        let root = Path::new("/docs");
        let file = classify_path(root, Path::new("/docs/af_p40_fy2025.xlsx")).unwrap();
        assert_eq!(file.exhibit, Some(ExhibitType::ProcurementDetail));
    }

    #[test]
    fn test_exhibit_codes_match_whole_tokens_only() {
        let root = Path::new("/docs");
        // "custom" carries "om", "omnibus" starts with it; neither is O&M.
        let file =
            classify_path(root, Path::new("/docs/custom_report_fy2025.pdf")).unwrap();
        assert_eq!(file.exhibit, None);
        let file = classify_path(root, Path::new("/docs/omnibus_fy2025.xlsx")).unwrap();
        assert_eq!(file.exhibit, None);
        // The real code still matches as its own token.
        let file = classify_path(root, Path::new("/docs/navy_om_fy2025.xlsx")).unwrap();
        assert_eq!(file.exhibit, Some(ExhibitType::OperationMaintenance));
    }

    #[test]
    fn test_classified_dir_layout() {
        let root = Path::new("/docs");
        let file =
            classify_path(root, Path::new("/docs/navy_p1_fy2025.xlsx")).unwrap();
        let dir = classified_dir(root, &file).unwrap();
        assert_eq!(
            dir,
            Path::new("/docs/fy2025/base-request/unclassified/procurement-summary")
        );
    }

    #[test]
    fn test_migrate_layout_moves_flat_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join("navy_p1_fy2025.xlsx"), b"stub").unwrap();
        fs::write(root.join("notes.txt"), b"ignored").unwrap();

        // Dry run first: nothing moves.
        let dry = migrate_layout(root, true).unwrap();
        assert_eq!(dry.moved, 1);
        assert!(root.join("navy_p1_fy2025.xlsx").exists());

        let real = migrate_layout(root, false).unwrap();
        assert_eq!(real.moved, 1);
        assert!(root
            .join("fy2025/base-request/unclassified/procurement-summary/navy_p1_fy2025.xlsx")
            .exists());
        assert!(!root.join("navy_p1_fy2025.xlsx").exists());

        // Second pass: already placed.
        let again = migrate_layout(root, false).unwrap();
        assert_eq!(again.moved, 0);
        assert_eq!(again.already_placed, 1);
    }
}
