// Exhibit Catalog - column specs per budget document type
//
// Every supported document type is a variant of ExhibitType, so dispatch
// is exhaustive at compile time instead of a string-keyed lookup that
// silently misses. Each variant carries a static ExhibitSpec: the ordered
// canonical fields, the header substrings that identify them, and the
// row offset where the header lives.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// FISCAL YEAR WINDOW
// ============================================================================

/// Fiscal years the fact-table schema carries amount columns for.
/// Extending the window is an additive schema change.
pub const FISCAL_YEARS: &[u16] = &[2023, 2024, 2025, 2026, 2027];

/// Amount kinds tracked per fiscal year.
pub const AMOUNT_KINDS: &[&str] = &["total", "base"];

/// Quantity kinds tracked per fiscal year.
pub const QUANTITY_KINDS: &[&str] = &["qty"];

/// Fact-table column name for a (fiscal year, amount kind) pair.
pub fn amount_column(fy: u16, kind: &str) -> String {
    format!("amount_fy{}_{}", fy, kind)
}

/// Fact-table column name for a (fiscal year, quantity kind) pair.
pub fn quantity_column(fy: u16, kind: &str) -> String {
    format!("qty_fy{}_{}", fy, kind)
}

// ============================================================================
// EXHIBIT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExhibitType {
    /// P-1: procurement totals per account/line item
    ProcurementSummary,
    /// P-40: per-weapon-system procurement detail
    ProcurementDetail,
    /// R-1: RDT&E totals per program element
    RdteSummary,
    /// R-2: per-program-element RDT&E detail with narrative
    RdteDetail,
    /// O-1: operation & maintenance totals
    OperationMaintenance,
    /// M-1: military personnel totals
    PersonnelSummary,
    /// Comptroller roll-up across services. The designated aggregator
    /// source for cross-service reconciliation.
    ComptrollerSummary,
}

impl ExhibitType {
    pub const ALL: &'static [ExhibitType] = &[
        ExhibitType::ProcurementSummary,
        ExhibitType::ProcurementDetail,
        ExhibitType::RdteSummary,
        ExhibitType::RdteDetail,
        ExhibitType::OperationMaintenance,
        ExhibitType::PersonnelSummary,
        ExhibitType::ComptrollerSummary,
    ];

    /// Stable key persisted in the fact table.
    pub fn key(&self) -> &'static str {
        match self {
            ExhibitType::ProcurementSummary => "procurement-summary",
            ExhibitType::ProcurementDetail => "procurement-detail",
            ExhibitType::RdteSummary => "rdte-summary",
            ExhibitType::RdteDetail => "rdte-detail",
            ExhibitType::OperationMaintenance => "om-summary",
            ExhibitType::PersonnelSummary => "personnel-summary",
            ExhibitType::ComptrollerSummary => "comptroller-summary",
        }
    }

    /// Parse a persisted key back to a variant. Unknown keys are None;
    /// the validator reports them, ingestion never writes them.
    pub fn from_key(key: &str) -> Option<ExhibitType> {
        ExhibitType::ALL.iter().copied().find(|e| e.key() == key)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExhibitType::ProcurementSummary => "Procurement Summary (P-1)",
            ExhibitType::ProcurementDetail => "Procurement Detail (P-40)",
            ExhibitType::RdteSummary => "RDT&E Summary (R-1)",
            ExhibitType::RdteDetail => "RDT&E Detail (R-2)",
            ExhibitType::OperationMaintenance => "Operation & Maintenance (O-1)",
            ExhibitType::PersonnelSummary => "Military Personnel (M-1)",
            ExhibitType::ComptrollerSummary => "Comptroller Summary",
        }
    }

    /// Static column spec for this exhibit type.
    pub fn spec(&self) -> &'static ExhibitSpec {
        match self {
            ExhibitType::ProcurementSummary => &PROCUREMENT_SUMMARY_SPEC,
            ExhibitType::ProcurementDetail => &PROCUREMENT_DETAIL_SPEC,
            ExhibitType::RdteSummary => &RDTE_SUMMARY_SPEC,
            ExhibitType::RdteDetail => &RDTE_DETAIL_SPEC,
            ExhibitType::OperationMaintenance => &OM_SPEC,
            ExhibitType::PersonnelSummary => &PERSONNEL_SPEC,
            ExhibitType::ComptrollerSummary => &COMPTROLLER_SPEC,
        }
    }
}

/// The (summary, detail) pairs checked by cross-exhibit reconciliation.
pub const RECONCILE_PAIRS: &[(ExhibitType, ExhibitType)] = &[
    (ExhibitType::ProcurementSummary, ExhibitType::ProcurementDetail),
    (ExhibitType::RdteSummary, ExhibitType::RdteDetail),
];

// ============================================================================
// SPEC TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Amount,
    Quantity,
}

/// One canonical field and the header substrings that identify it.
#[derive(Debug)]
pub struct FieldSpec {
    /// Canonical field name, unique within a spec.
    pub name: &'static str,
    /// Substring patterns matched against the normalized header cell.
    /// Longer patterns win over shorter ones.
    pub patterns: &'static [&'static str],
    pub kind: FieldKind,
    pub description: &'static str,
}

/// Static schema for one document type.
#[derive(Debug)]
pub struct ExhibitSpec {
    /// Zero-based row index where the header row lives.
    pub header_row: usize,
    pub fields: &'static [FieldSpec],
    /// Free-text notes on header drift observed across fiscal years.
    /// Consulted by maintainers, not machine-enforced.
    pub known_variations: &'static [&'static str],
}

macro_rules! field {
    ($name:expr, $kind:expr, [$($pat:expr),+ $(,)?], $desc:expr) => {
        FieldSpec {
            name: $name,
            patterns: &[$($pat),+],
            kind: $kind,
            description: $desc,
        }
    };
}

// Shared identity fields. Amount fields per fiscal year are appended in
// each spec so patterns like "fy 2025" resolve to the right column.
static PROCUREMENT_SUMMARY_SPEC: ExhibitSpec = ExhibitSpec {
    header_row: 1,
    fields: &[
        field!("organization", FieldKind::Text, ["organization", "service", "department"], "Owning military department or agency"),
        field!("account", FieldKind::Text, ["account"], "Appropriation account code"),
        field!("account_title", FieldKind::Text, ["account title", "appropriation title"], "Appropriation account display title"),
        field!("line_item", FieldKind::Text, ["line number", "line item", "li "], "Budget line item number"),
        field!("line_item_title", FieldKind::Text, ["line item title", "item title", "nomenclature"], "Line item display title"),
        field!("amount_unit", FieldKind::Text, ["dollars in", "unit"], "Unit the amounts are stated in"),
        field!("fy2023_total", FieldKind::Amount, ["fy 2023 total", "fy 2023", "fy23"], "FY2023 total"),
        field!("fy2024_total", FieldKind::Amount, ["fy 2024 total", "fy 2024", "fy24"], "FY2024 total"),
        field!("fy2025_total", FieldKind::Amount, ["fy 2025 total", "fy 2025", "fy25"], "FY2025 total"),
        field!("fy2026_total", FieldKind::Amount, ["fy 2026 total", "fy 2026", "fy26"], "FY2026 total"),
        field!("fy2027_total", FieldKind::Amount, ["fy 2027 total", "fy 2027", "fy27"], "FY2027 total"),
        field!("fy2025_qty", FieldKind::Quantity, ["fy 2025 quantity", "quantity"], "FY2025 unit quantity"),
    ],
    known_variations: &[
        "FY2021 books spell the line column 'Line No'; 2022 onward use 'Line Number'",
        "Some P-1 tabs embed a newline inside 'Line Item\\nTitle'",
    ],
};

static PROCUREMENT_DETAIL_SPEC: ExhibitSpec = ExhibitSpec {
    header_row: 2,
    fields: &[
        field!("organization", FieldKind::Text, ["organization", "service"], "Owning military department or agency"),
        field!("account", FieldKind::Text, ["account"], "Appropriation account code"),
        field!("line_item", FieldKind::Text, ["line number", "line item"], "Budget line item number"),
        field!("line_item_title", FieldKind::Text, ["line item title", "item nomenclature"], "Line item display title"),
        field!("amount_unit", FieldKind::Text, ["dollars in"], "Unit the amounts are stated in"),
        field!("fy2023_total", FieldKind::Amount, ["fy 2023 total", "fy 2023"], "FY2023 total"),
        field!("fy2024_total", FieldKind::Amount, ["fy 2024 total", "fy 2024"], "FY2024 total"),
        field!("fy2025_total", FieldKind::Amount, ["fy 2025 total", "fy 2025"], "FY2025 total"),
        field!("fy2025_base", FieldKind::Amount, ["fy 2025 base"], "FY2025 base request"),
        field!("fy2026_total", FieldKind::Amount, ["fy 2026 total", "fy 2026"], "FY2026 total"),
        field!("fy2027_total", FieldKind::Amount, ["fy 2027 total", "fy 2027"], "FY2027 total"),
        field!("fy2025_qty", FieldKind::Quantity, ["fy 2025 quantity", "quantity"], "FY2025 unit quantity"),
    ],
    known_variations: &[
        "P-40 header row drifted from row 2 to row 3 in one 2024 Air Force book; those files are fixed upstream",
    ],
};

static RDTE_SUMMARY_SPEC: ExhibitSpec = ExhibitSpec {
    header_row: 1,
    fields: &[
        field!("organization", FieldKind::Text, ["organization", "service"], "Owning military department or agency"),
        field!("account", FieldKind::Text, ["account"], "Appropriation account code"),
        field!("account_title", FieldKind::Text, ["account title"], "Appropriation account display title"),
        field!("program_element", FieldKind::Text, ["program element number", "program element", "pe number"], "Program element number"),
        field!("element_title", FieldKind::Text, ["program element title", "pe title", "item title"], "Program element display title"),
        field!("amount_unit", FieldKind::Text, ["dollars in"], "Unit the amounts are stated in"),
        field!("fy2023_total", FieldKind::Amount, ["fy 2023 total", "fy 2023"], "FY2023 total"),
        field!("fy2024_total", FieldKind::Amount, ["fy 2024 total", "fy 2024"], "FY2024 total"),
        field!("fy2025_total", FieldKind::Amount, ["fy 2025 total", "fy 2025"], "FY2025 total"),
        field!("fy2025_base", FieldKind::Amount, ["fy 2025 base"], "FY2025 base request"),
        field!("fy2026_total", FieldKind::Amount, ["fy 2026 total", "fy 2026"], "FY2026 total"),
        field!("fy2027_total", FieldKind::Amount, ["fy 2027 total", "fy 2027"], "FY2027 total"),
    ],
    known_variations: &[
        "R-1 books before 2023 say 'PE No.' where later books say 'Program Element Number'",
    ],
};

static RDTE_DETAIL_SPEC: ExhibitSpec = ExhibitSpec {
    header_row: 1,
    fields: &[
        field!("organization", FieldKind::Text, ["organization", "service"], "Owning military department or agency"),
        field!("account", FieldKind::Text, ["account"], "Appropriation account code"),
        field!("program_element", FieldKind::Text, ["program element number", "program element"], "Program element number"),
        field!("element_title", FieldKind::Text, ["program element title", "project title"], "Program element display title"),
        field!("line_item", FieldKind::Text, ["project number", "line item"], "Project number within the element"),
        field!("amount_unit", FieldKind::Text, ["dollars in"], "Unit the amounts are stated in"),
        field!("fy2023_total", FieldKind::Amount, ["fy 2023 total", "fy 2023"], "FY2023 total"),
        field!("fy2024_total", FieldKind::Amount, ["fy 2024 total", "fy 2024"], "FY2024 total"),
        field!("fy2025_total", FieldKind::Amount, ["fy 2025 total", "fy 2025"], "FY2025 total"),
        field!("fy2026_total", FieldKind::Amount, ["fy 2026 total", "fy 2026"], "FY2026 total"),
        field!("fy2027_total", FieldKind::Amount, ["fy 2027 total", "fy 2027"], "FY2027 total"),
    ],
    known_variations: &[],
};

static OM_SPEC: ExhibitSpec = ExhibitSpec {
    header_row: 1,
    fields: &[
        field!("organization", FieldKind::Text, ["organization", "service"], "Owning military department or agency"),
        field!("account", FieldKind::Text, ["account"], "Appropriation account code"),
        field!("line_item", FieldKind::Text, ["sag", "line item", "budget activity"], "Sub-activity group"),
        field!("line_item_title", FieldKind::Text, ["sag title", "activity title"], "Sub-activity group title"),
        field!("fy2024_total", FieldKind::Amount, ["fy 2024 total", "fy 2024"], "FY2024 total"),
        field!("fy2025_total", FieldKind::Amount, ["fy 2025 total", "fy 2025"], "FY2025 total"),
        field!("fy2026_total", FieldKind::Amount, ["fy 2026 total", "fy 2026"], "FY2026 total"),
    ],
    known_variations: &[],
};

static PERSONNEL_SPEC: ExhibitSpec = ExhibitSpec {
    header_row: 1,
    fields: &[
        field!("organization", FieldKind::Text, ["organization", "service"], "Owning military department or agency"),
        field!("account", FieldKind::Text, ["account"], "Appropriation account code"),
        field!("line_item", FieldKind::Text, ["budget activity", "line item"], "Budget activity"),
        field!("line_item_title", FieldKind::Text, ["activity title"], "Budget activity title"),
        field!("fy2024_total", FieldKind::Amount, ["fy 2024 total", "fy 2024"], "FY2024 total"),
        field!("fy2025_total", FieldKind::Amount, ["fy 2025 total", "fy 2025"], "FY2025 total"),
        field!("fy2026_total", FieldKind::Amount, ["fy 2026 total", "fy 2026"], "FY2026 total"),
    ],
    known_variations: &[],
};

static COMPTROLLER_SPEC: ExhibitSpec = ExhibitSpec {
    header_row: 0,
    fields: &[
        field!("organization", FieldKind::Text, ["organization", "component"], "Reporting component"),
        field!("account", FieldKind::Text, ["account"], "Appropriation account code"),
        field!("account_title", FieldKind::Text, ["account title", "appropriation"], "Appropriation account display title"),
        field!("fy2024_total", FieldKind::Amount, ["fy 2024 total", "fy 2024"], "FY2024 total"),
        field!("fy2025_total", FieldKind::Amount, ["fy 2025 total", "fy 2025"], "FY2025 total"),
        field!("fy2026_total", FieldKind::Amount, ["fy 2026 total", "fy 2026"], "FY2026 total"),
    ],
    known_variations: &[
        "Comptroller roll-ups label the service column 'Component' instead of 'Organization'",
    ],
};

// ============================================================================
// COLUMN MAPPER
// ============================================================================

/// Normalize a header cell: lowercase, collapse embedded newlines and
/// whitespace runs to single spaces.
pub fn normalize_header(cell: &str) -> String {
    cell.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map spreadsheet columns to canonical field names for one exhibit type.
///
/// For every (column, field) pair where a field pattern is a substring of
/// the normalized header, record a candidate weighted by pattern length;
/// sort candidates by descending length so the most specific pattern wins
/// ("account title" beats "account"); greedily commit, rejecting any
/// column or field already taken. No column maps to two fields and no
/// field claims two columns.
pub fn map_columns(exhibit: ExhibitType, headers: &[String]) -> HashMap<usize, &'static str> {
    let spec = exhibit.spec();
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();

    // (pattern length, column, field index)
    let mut candidates: Vec<(usize, usize, usize)> = Vec::new();
    for (col, header) in normalized.iter().enumerate() {
        if header.is_empty() {
            continue;
        }
        for (fi, field) in spec.fields.iter().enumerate() {
            for pattern in field.patterns {
                if header.contains(pattern) {
                    candidates.push((pattern.len(), col, fi));
                }
            }
        }
    }

    // Longest pattern first; column and field index break ties so the
    // result is deterministic for any header permutation.
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut mapping: HashMap<usize, &'static str> = HashMap::new();
    let mut used_fields: Vec<bool> = vec![false; spec.fields.len()];

    for (_, col, fi) in candidates {
        if mapping.contains_key(&col) || used_fields[fi] {
            continue;
        }
        mapping.insert(col, spec.fields[fi].name);
        used_fields[fi] = true;
    }

    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn headers(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_field_names_unique_within_each_spec() {
        for exhibit in ExhibitType::ALL {
            let mut seen = HashSet::new();
            for field in exhibit.spec().fields {
                assert!(
                    seen.insert(field.name),
                    "{:?} repeats field {}",
                    exhibit,
                    field.name
                );
            }
        }
    }

    #[test]
    fn test_key_round_trip() {
        for exhibit in ExhibitType::ALL {
            assert_eq!(ExhibitType::from_key(exhibit.key()), Some(*exhibit));
        }
        assert_eq!(ExhibitType::from_key("made-up"), None);
    }

    #[test]
    fn test_normalize_header_collapses_whitespace() {
        assert_eq!(normalize_header("Line Item\nTitle"), "line item title");
        assert_eq!(normalize_header("  FY   2025  Total "), "fy 2025 total");
    }

    #[test]
    fn test_longest_pattern_wins() {
        // "Account Title" matches both the "account" and "account title"
        // patterns; the longer one must claim the column.
        let mapping = map_columns(
            ExhibitType::ProcurementSummary,
            &headers(&["Account", "Account Title", "Line Number"]),
        );
        assert_eq!(mapping[&0], "account");
        assert_eq!(mapping[&1], "account_title");
        assert_eq!(mapping[&2], "line_item");
    }

    #[test]
    fn test_no_double_assignment() {
        let hs = headers(&[
            "Organization",
            "Account",
            "Account Title",
            "Line Number",
            "Line Item Title",
            "FY 2024 Total",
            "FY 2025 Total",
            "FY 2025 Quantity",
        ]);
        let mapping = map_columns(ExhibitType::ProcurementSummary, &hs);

        let fields: HashSet<_> = mapping.values().collect();
        assert_eq!(fields.len(), mapping.len(), "a field claimed two columns");
        assert_eq!(mapping[&5], "fy2024_total");
        assert_eq!(mapping[&6], "fy2025_total");
        assert_eq!(mapping[&7], "fy2025_qty");
    }

    #[test]
    fn test_deterministic_across_runs() {
        let hs = headers(&["Account", "Account Title", "FY 2025", "FY 2025 Base"]);
        let first = map_columns(ExhibitType::RdteSummary, &hs);
        for _ in 0..10 {
            assert_eq!(map_columns(ExhibitType::RdteSummary, &hs), first);
        }
    }

    #[test]
    fn test_unmatched_headers_ignored() {
        let mapping = map_columns(
            ExhibitType::ProcurementSummary,
            &headers(&["Notes", "Classification", ""]),
        );
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_amount_column_names() {
        assert_eq!(amount_column(2025, "total"), "amount_fy2025_total");
        assert_eq!(quantity_column(2025, "qty"), "qty_fy2025_qty");
    }
}
