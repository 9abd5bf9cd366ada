// Budgetline - Core Library
// Budget document ingestion, validation, and enrichment over SQLite.

pub mod cache;
pub mod catalog;
pub mod classify;
pub mod db;
pub mod download;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod numeric;
pub mod reconcile;
pub mod refresh;
pub mod report;
pub mod validation;

// Re-export commonly used types
pub use cache::TtlCache;
pub use catalog::{
    amount_column, map_columns, quantity_column, ExhibitSpec, ExhibitType, FieldKind, FieldSpec,
    AMOUNT_KINDS, FISCAL_YEARS, QUANTITY_KINDS, RECONCILE_PAIRS,
};
pub use classify::{
    classify_path, migrate_layout, BudgetCycle, DocumentKind, MigrationSummary, SourceFile,
};
pub use db::{
    open_database, search_lines, search_pages, setup_database, BatchCursor, BudgetLine,
    DocumentPage, IngestionRecord, PageHit,
};
pub use download::{DownloadConfig, DownloadSummary, DownloadTask, HostTimings, ManifestEntry};
pub use enrich::{
    enrich, index_entry, links_to, links_to_cached, EnrichmentEngine, EnrichmentSummary,
    LineageLink, ProgramElementEntry,
};
pub use error::BudgetlineError;
pub use ingest::{build, CheckpointSession, IngestionSummary};
pub use numeric::{coerce_amount, coerce_quantity};
pub use reconcile::{
    reconcile, ReconFinding, ReconStatus, ReconcileConfig, ReconcileReport, ReconciliationEngine,
};
pub use refresh::{
    next_run_after, run_scheduled, ProgressSnapshot, RefreshOptions, RunSummary, ScheduleInterval,
    Stage, StageResult, StageStatus,
};
pub use report::{render_html, write_reports, ReportPaths};
pub use validation::{
    validate, Severity, ValidationConfig, ValidationEngine, ValidationIssue, ValidationReport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
