// Checkpointed ingestion pipeline
//
// One build run: open/confirm the database, create or resume a
// checkpoint session, then parse every discovered file that is new or
// changed. A corrupt file is caught at the file boundary, recorded as
// error state, and the batch continues. FTS triggers are suspended for
// bulk loads and the index rebuilt once at the end.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::catalog::{self, ExhibitType, FieldKind};
use crate::classify::{classify_path, DocumentKind, SourceFile};
use crate::db::{self, BudgetLine, DocumentPage, IngestionRecord};
use crate::error::BudgetlineError;
use crate::numeric::{coerce_amount, coerce_quantity};

/// Files beyond this count trigger bulk-load mode: FTS triggers dropped,
/// index rebuilt once after the batch.
const BULK_LOAD_THRESHOLD: usize = 5;

// ============================================================================
// CHECKPOINT SESSION
// ============================================================================

/// Resumable state for one ingestion run. Created at start, marked
/// complete at the end; a crash leaves the newest session incomplete and
/// the next run resumes it, skipping files already processed.
#[derive(Debug)]
pub struct CheckpointSession {
    pub session_id: String,
    pub resumed: bool,
    processed: HashSet<String>,
}

impl CheckpointSession {
    /// Resume the newest incomplete session or create a fresh one.
    pub fn resume_or_create(conn: &Connection) -> Result<CheckpointSession> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT session_id FROM checkpoint_sessions
                 WHERE completed = 0 ORDER BY started_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();

        if let Some(session_id) = existing {
            let mut stmt =
                conn.prepare("SELECT file_key FROM checkpoint_files WHERE session_id = ?1")?;
            let processed = stmt
                .query_map(params![session_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<HashSet<_>, _>>()?;
            info!(%session_id, resumed_files = processed.len(), "resuming checkpoint session");
            return Ok(CheckpointSession {
                session_id,
                resumed: true,
                processed,
            });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO checkpoint_sessions (session_id, started_at, completed)
             VALUES (?1, ?2, 0)",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(CheckpointSession {
            session_id,
            resumed: false,
            processed: HashSet::new(),
        })
    }

    pub fn is_processed(&self, file_key: &str) -> bool {
        self.processed.contains(file_key)
    }

    pub fn mark_processed(&mut self, conn: &Connection, file_key: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO checkpoint_files (session_id, file_key) VALUES (?1, ?2)",
            params![self.session_id, file_key],
        )?;
        self.processed.insert(file_key.to_string());
        Ok(())
    }

    pub fn complete(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE checkpoint_sessions SET completed = 1 WHERE session_id = ?1",
            params![self.session_id],
        )?;
        Ok(())
    }
}

// ============================================================================
// BUILD
// ============================================================================

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub files_seen: usize,
    pub files_ingested: usize,
    pub files_skipped: usize,
    pub files_errored: usize,
    pub rows_inserted: usize,
    pub pages_inserted: usize,
    pub elapsed_secs: f64,
}

/// Build or rebuild the fact store from a documents root.
///
/// Fails fast when the documents root does not exist. With
/// `rebuild = true`, all per-table and index state is recreated from
/// scratch and every file is treated as new, so every ingestion-state
/// timestamp advances even when row counts are unchanged.
pub fn build(documents_root: &Path, db_path: &Path, rebuild: bool) -> Result<IngestionSummary> {
    let start = Instant::now();

    if !documents_root.is_dir() {
        return Err(BudgetlineError::precondition(format!(
            "documents root does not exist: {}",
            documents_root.display()
        ))
        .into());
    }

    let mut conn = db::open_database(db_path)?;
    if rebuild {
        info!("rebuild requested; resetting database");
        db::reset_database(&conn)?;
    }

    let mut session = CheckpointSession::resume_or_create(&conn)?;

    let (files, unsupported) = discover_files(documents_root);
    info!(
        files = files.len(),
        unsupported = unsupported.len(),
        root = %documents_root.display(),
        "discovered source files"
    );

    let mut summary = IngestionSummary {
        files_seen: files.len() + unsupported.len(),
        ..Default::default()
    };

    // Unsupported extensions stay visible as error records.
    for path in &unsupported {
        warn!(file = %path.display(), "unsupported extension");
        summary.files_errored += 1;
        let record = stat_record(path, 0, "error:unsupported")?;
        db::upsert_ingestion_record(&conn, &record)?;
    }

    // Decide bulk mode up front from the number of files that will parse.
    let pending: Vec<&SourceFile> = files
        .iter()
        .filter(|f| needs_ingest(&conn, &session, f, rebuild).unwrap_or(true))
        .collect();
    let bulk = pending.len() > BULK_LOAD_THRESHOLD;
    if bulk {
        info!(pending = pending.len(), "bulk load: suspending FTS triggers");
        db::drop_fts_triggers(&conn)?;
    }

    for file in &files {
        let key = file.key();
        if !needs_ingest(&conn, &session, file, rebuild)? {
            debug!(file = %key, "unchanged; skipping");
            summary.files_skipped += 1;
            continue;
        }

        match ingest_file(&mut conn, file) {
            Ok((rows, pages)) => {
                summary.files_ingested += 1;
                summary.rows_inserted += rows;
                summary.pages_inserted += pages;
            }
            Err(err) => {
                // File-boundary capture: record and continue the batch.
                warn!(file = %key, error = %err, "file failed to ingest");
                summary.files_errored += 1;
                let record = stat_record(&file.path, 0, &format!("error:{}", err))?;
                db::upsert_ingestion_record(&conn, &record)?;
            }
        }
        session.mark_processed(&conn, &key)?;
    }

    if bulk {
        info!("rebuilding FTS index after bulk load");
        db::rebuild_fts(&conn)?;
        db::create_fts_triggers(&conn)?;
    }

    session.complete(&conn)?;
    summary.elapsed_secs = start.elapsed().as_secs_f64();
    info!(
        ingested = summary.files_ingested,
        skipped = summary.files_skipped,
        errored = summary.files_errored,
        rows = summary.rows_inserted,
        "build complete"
    );
    Ok(summary)
}

/// Walk the documents tree. Files with a supported extension come back
/// classified; the rest are returned separately so the build can record
/// them instead of losing them. Deterministic order: sorted by path.
pub fn discover_files(documents_root: &Path) -> (Vec<SourceFile>, Vec<std::path::PathBuf>) {
    let mut files = Vec::new();
    let mut unsupported = Vec::new();
    for entry in walkdir::WalkDir::new(documents_root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        match classify_path(documents_root, entry.path()) {
            Some(file) => files.push(file),
            None => unsupported.push(entry.path().to_path_buf()),
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    unsupported.sort();
    (files, unsupported)
}

/// Incremental skip rule: a record with status ok and matching size,
/// mtime, and content hash is never reprocessed unless rebuild is
/// forced. A resumed session also skips files it already finished.
fn needs_ingest(
    conn: &Connection,
    session: &CheckpointSession,
    file: &SourceFile,
    rebuild: bool,
) -> Result<bool> {
    if rebuild {
        return Ok(!session.is_processed(&file.key()));
    }
    if session.resumed && session.is_processed(&file.key()) {
        return Ok(false);
    }

    let Some(record) = db::get_ingestion_record(conn, &file.key())? else {
        return Ok(true);
    };
    if !record.is_ok() {
        return Ok(true);
    }

    let meta = std::fs::metadata(&file.path)
        .with_context(|| format!("stat {}", file.path.display()))?;
    let mtime = file_mtime(&meta);
    if record.file_size != meta.len() || record.modified_time != mtime {
        return Ok(true);
    }
    // Size and mtime match; the hash settles edits that preserved both.
    Ok(db::hash_file(&file.path)? != record.content_hash)
}

fn file_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn stat_record(path: &Path, row_count: i64, status: &str) -> Result<IngestionRecord> {
    let (size, mtime, hash) = match std::fs::metadata(path) {
        Ok(meta) => {
            let hash = db::hash_file(path).unwrap_or_default();
            (meta.len(), file_mtime(&meta), hash)
        }
        Err(_) => (0, 0, String::new()),
    };
    Ok(IngestionRecord {
        file_path: path.to_string_lossy().into_owned(),
        file_size: size,
        modified_time: mtime,
        content_hash: hash,
        row_count,
        status: status.to_string(),
        last_ingested: Utc::now().to_rfc3339(),
    })
}

/// Parse one file and replace its rows. Returns (fact rows, pages).
fn ingest_file(conn: &mut Connection, file: &SourceFile) -> Result<(usize, usize)> {
    let pending = stat_record(&file.path, 0, "pending")?;
    db::upsert_ingestion_record(conn, &pending)?;

    // Re-ingestion is delete-then-insert so corrections replace rows.
    db::delete_lines_for_file(conn, &file.key())?;

    let (rows, pages) = match file.kind {
        DocumentKind::Spreadsheet => {
            let lines = parse_spreadsheet(file)?;
            let n = db::insert_budget_lines(conn, &lines)?;
            (n, 0)
        }
        DocumentKind::Pdf => {
            let pages = parse_pdf(file)?;
            let n = db::insert_pages(conn, &pages)?;
            (0, n)
        }
    };

    let record = stat_record(&file.path, (rows + pages) as i64, "ok")?;
    db::upsert_ingestion_record(conn, &record)?;
    info!(file = %file.key(), rows, pages, "ingested");
    Ok((rows, pages))
}

// ============================================================================
// SPREADSHEET PARSING
// ============================================================================

/// Parse a CSV or Excel file into fact rows via the exhibit catalog.
pub fn parse_spreadsheet(file: &SourceFile) -> Result<Vec<BudgetLine>> {
    let exhibit = file
        .exhibit
        .ok_or_else(|| anyhow!("unresolved exhibit type"))?;

    let ext = file
        .path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    let grid = match ext.as_str() {
        "csv" => read_csv_grid(&file.path)?,
        "xlsx" | "xls" => read_excel_grid(&file.path)?,
        other => return Err(anyhow!("unsupported spreadsheet extension: {}", other)),
    };

    grid_to_lines(file, exhibit, &grid)
}

fn read_csv_grid(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record.context("reading CSV row")?;
        grid.push(record.iter().map(|c| c.to_string()).collect());
    }
    Ok(grid)
}

fn read_excel_grid(path: &Path) -> Result<Vec<Vec<String>>> {
    use calamine::{Data, Reader};

    let mut workbook = calamine::open_workbook_auto(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("workbook has no sheets"))?
        .context("reading first worksheet")?;

    let grid = range
        .rows()
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Data::Empty => String::new(),
                    Data::String(s) => s.clone(),
                    Data::Float(f) => {
                        if f.fract() == 0.0 {
                            format!("{}", *f as i64)
                        } else {
                            f.to_string()
                        }
                    }
                    Data::Int(i) => i.to_string(),
                    Data::Bool(b) => b.to_string(),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect();
    Ok(grid)
}

/// Map the header row and coerce every data row into a BudgetLine.
/// Malformed numeric cells become NULL amounts, never errors; rows with
/// no mapped content are dropped.
fn grid_to_lines(
    file: &SourceFile,
    exhibit: ExhibitType,
    grid: &[Vec<String>],
) -> Result<Vec<BudgetLine>> {
    let spec = exhibit.spec();
    if grid.len() <= spec.header_row {
        return Err(anyhow!(
            "file has {} rows; header expected at row {}",
            grid.len(),
            spec.header_row
        ));
    }

    let mapping = catalog::map_columns(exhibit, &grid[spec.header_row]);
    if mapping.is_empty() {
        return Err(anyhow!("no recognizable header columns"));
    }

    let field_kinds: HashMap<&str, FieldKind> = spec
        .fields
        .iter()
        .map(|f| (f.name, f.kind))
        .collect();

    let mut lines = Vec::new();
    for row in grid.iter().skip(spec.header_row + 1) {
        let mut line = BudgetLine {
            source_file: file.key(),
            exhibit_type: exhibit.key().to_string(),
            fiscal_year: file.fiscal_year.unwrap_or(0),
            budget_cycle: file.cycle.map(|c| c.key().to_string()),
            ..Default::default()
        };
        let mut any_content = false;

        for (&col, &field) in &mapping {
            let Some(cell) = row.get(col) else { continue };
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            any_content = true;

            match field_kinds.get(field) {
                Some(FieldKind::Amount) => {
                    if let (Some(column), Some(value)) =
                        (amount_field_to_column(field), coerce_amount(cell))
                    {
                        line.amounts.insert(column, value);
                    }
                }
                Some(FieldKind::Quantity) => {
                    if let (Some(column), Some(value)) =
                        (quantity_field_to_column(field), coerce_quantity(cell))
                    {
                        line.quantities.insert(column, value);
                    }
                }
                _ => assign_text_field(&mut line, field, cell),
            }
        }

        if any_content {
            lines.push(line);
        }
    }
    Ok(lines)
}

fn assign_text_field(line: &mut BudgetLine, field: &str, value: &str) {
    let v = value.to_string();
    match field {
        "organization" => line.organization = Some(v),
        "account" => line.account = v,
        "account_title" => line.account_title = Some(v),
        "line_item" => line.line_item = v,
        "line_item_title" => line.line_item_title = Some(v),
        "program_element" => line.program_element = Some(v),
        "element_title" => line.element_title = Some(v),
        "amount_unit" => line.amount_unit = Some(v),
        _ => {}
    }
}

/// "fy2025_total" -> "amount_fy2025_total"
fn amount_field_to_column(field: &str) -> Option<String> {
    let rest = field.strip_prefix("fy")?;
    let (year, kind) = rest.split_once('_')?;
    let fy: u16 = year.parse().ok()?;
    Some(catalog::amount_column(fy, kind))
}

/// "fy2025_qty" -> "qty_fy2025_qty"
fn quantity_field_to_column(field: &str) -> Option<String> {
    let rest = field.strip_prefix("fy")?;
    let (year, kind) = rest.split_once('_')?;
    let fy: u16 = year.parse().ok()?;
    Some(catalog::quantity_column(fy, kind))
}

// ============================================================================
// PDF PARSING
// ============================================================================

/// Extract page text and a table-detected flag per page. Best effort:
/// quality is measured by the validator, not guaranteed here.
pub fn parse_pdf(file: &SourceFile) -> Result<Vec<DocumentPage>> {
    let doc = lopdf::Document::load(&file.path)
        .with_context(|| format!("loading {}", file.path.display()))?;

    let mut pages = Vec::new();
    for (&page_number, _) in doc.get_pages().iter() {
        let text = doc.extract_text(&[page_number]).unwrap_or_default();
        let (has_table, table_payload) = detect_table(&text);
        pages.push(DocumentPage {
            source_file: file.key(),
            page_number,
            text,
            has_table,
            table_payload,
        });
    }

    if pages.is_empty() {
        return Err(anyhow!("PDF contains no pages"));
    }
    Ok(pages)
}

/// A page "has a table" when at least three lines split into three or
/// more column runs (tabs or 2+ space gaps). The raw split rows become
/// the table payload.
fn detect_table(text: &str) -> (bool, Option<String>) {
    let mut rows: Vec<Vec<String>> = Vec::new();
    for line in text.lines() {
        let cells: Vec<String> = line
            .split(|c| c == '\t')
            .flat_map(|part| part.split("  "))
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if cells.len() >= 3 {
            rows.push(cells);
        }
    }

    if rows.len() >= 3 {
        let payload = serde_json::to_string(&rows).ok();
        (true, payload)
    } else {
        (false, None)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const P1_CSV: &str = "\
Exhibit P-1 Procurement Program,,,,,
Organization,Account,Account Title,Line Number,Line Item Title,FY 2025 Total
Navy,1506N,Aircraft Procurement,0101,F/A-18 Squadrons,\"1,234.5\"
Navy,1506N,Aircraft Procurement,0102,Trainer Aircraft,(500)
Navy,1506N,Aircraft Procurement,0103,Spares,N/A
";

    fn write_fixture(root: &Path, name: &str, contents: &str) {
        fs::write(root.join(name), contents).unwrap();
    }

    fn fixture_tree() -> tempfile::TempDir {
        let tmp = tempdir().unwrap();
        write_fixture(tmp.path(), "navy_p1_fy2025.csv", P1_CSV);
        tmp
    }

    #[test]
    fn test_build_missing_root_is_precondition() {
        let tmp = tempdir().unwrap();
        let err = build(
            &tmp.path().join("nope"),
            &tmp.path().join("store.db"),
            false,
        )
        .unwrap_err();
        assert!(crate::error::is_precondition(&err));
    }

    #[test]
    fn test_build_well_formed_spreadsheet() {
        let docs = fixture_tree();
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("store.db");

        let summary = build(docs.path(), &db_path, false).unwrap();
        assert_eq!(summary.files_seen, 1);
        assert_eq!(summary.files_ingested, 1);
        assert_eq!(summary.rows_inserted, 3);
        assert_eq!(summary.files_errored, 0);

        let conn = db::open_database(&db_path).unwrap();
        assert_eq!(db::count_lines(&conn).unwrap(), 3);

        // The (500) cell coerced to -500, N/A to NULL.
        let mut cursor = db::BatchCursor::new(&conn, 10);
        let rows = cursor.next_batch().unwrap();
        let col = catalog::amount_column(2025, "total");
        let trainer = rows.iter().find(|r| r.line_item == "0102").unwrap();
        assert_eq!(trainer.amounts.get(&col), Some(&-500.0));
        let spares = rows.iter().find(|r| r.line_item == "0103").unwrap();
        assert!(spares.amounts.get(&col).is_none());
    }

    #[test]
    fn test_corrupt_file_is_file_boundary_error() {
        let docs = fixture_tree();
        // An xlsx that is not a zip at all.
        write_fixture(docs.path(), "army_p1_fy2025.xlsx", "this is not a workbook");

        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("store.db");
        let summary = build(docs.path(), &db_path, false).unwrap();

        // The corrupt file errors, the good one still lands: 3 fact rows,
        // one error record, no precondition failure.
        assert_eq!(summary.files_ingested, 1);
        assert_eq!(summary.files_errored, 1);
        assert_eq!(summary.rows_inserted, 3);

        let conn = db::open_database(&db_path).unwrap();
        let records = db::list_ingestion_records(&conn).unwrap();
        assert_eq!(records.iter().filter(|r| r.is_error()).count(), 1);
    }

    #[test]
    fn test_unsupported_extension_gets_error_record() {
        let docs = fixture_tree();
        write_fixture(docs.path(), "briefing_notes_fy2025.docx", "not a budget table");

        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("store.db");
        let summary = build(docs.path(), &db_path, false).unwrap();

        // The .docx never parses but stays visible in ingestion state.
        assert_eq!(summary.files_seen, 2);
        assert_eq!(summary.files_ingested, 1);
        assert_eq!(summary.files_errored, 1);

        let conn = db::open_database(&db_path).unwrap();
        let records = db::list_ingestion_records(&conn).unwrap();
        let doc = records
            .iter()
            .find(|r| r.file_path.ends_with("briefing_notes_fy2025.docx"))
            .unwrap();
        assert_eq!(doc.status, "error:unsupported");
        assert!(doc.is_error());
    }

    #[test]
    fn test_incremental_skip_and_retouch() {
        let docs = fixture_tree();
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("store.db");

        build(docs.path(), &db_path, false).unwrap();
        let conn = db::open_database(&db_path).unwrap();
        let before = db::list_ingestion_records(&conn).unwrap();
        drop(conn);

        // Unchanged tree: second run skips, timestamps identical.
        let second = build(docs.path(), &db_path, false).unwrap();
        assert_eq!(second.files_skipped, 1);
        assert_eq!(second.files_ingested, 0);
        let conn = db::open_database(&db_path).unwrap();
        let after = db::list_ingestion_records(&conn).unwrap();
        assert_eq!(before[0].last_ingested, after[0].last_ingested);
        drop(conn);

        // Touch content: exactly that file re-ingests.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        write_fixture(docs.path(), "navy_p1_fy2025.csv", P1_CSV.trim_end());
        let third = build(docs.path(), &db_path, false).unwrap();
        assert_eq!(third.files_ingested, 1);
        let conn = db::open_database(&db_path).unwrap();
        let retouched = db::list_ingestion_records(&conn).unwrap();
        assert_ne!(before[0].last_ingested, retouched[0].last_ingested);
    }

    #[test]
    fn test_rebuild_advances_all_timestamps() {
        let docs = fixture_tree();
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("store.db");

        build(docs.path(), &db_path, false).unwrap();
        let conn = db::open_database(&db_path).unwrap();
        let before = db::list_ingestion_records(&conn).unwrap();
        drop(conn);

        std::thread::sleep(std::time::Duration::from_millis(10));
        let summary = build(docs.path(), &db_path, true).unwrap();
        assert_eq!(summary.files_ingested, 1);
        assert_eq!(summary.rows_inserted, 3);

        let conn = db::open_database(&db_path).unwrap();
        let after = db::list_ingestion_records(&conn).unwrap();
        assert_ne!(before[0].last_ingested, after[0].last_ingested);
    }

    #[test]
    fn test_reingest_replaces_not_duplicates() {
        let docs = fixture_tree();
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("store.db");

        build(docs.path(), &db_path, false).unwrap();
        build(docs.path(), &db_path, true).unwrap();

        let conn = db::open_database(&db_path).unwrap();
        assert_eq!(db::count_lines(&conn).unwrap(), 3);
    }

    #[test]
    fn test_checkpoint_resume_skips_processed() {
        let docs = fixture_tree();
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("store.db");

        // Simulate a crash: session created, file marked processed,
        // session never completed.
        {
            let conn = db::open_database(&db_path).unwrap();
            let mut session = CheckpointSession::resume_or_create(&conn).unwrap();
            let key = docs
                .path()
                .join("navy_p1_fy2025.csv")
                .to_string_lossy()
                .into_owned();
            session.mark_processed(&conn, &key).unwrap();
        }

        let summary = build(docs.path(), &db_path, false).unwrap();
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.files_ingested, 0);

        // Session completed now; the next run starts fresh and ingests.
        let summary = build(docs.path(), &db_path, false).unwrap();
        assert_eq!(summary.files_ingested, 1);
    }

    #[test]
    fn test_detect_table() {
        let tabular = "Line  Item  FY25\n0101  F/A-18  1,234\n0102  Trainer  500\n0103  Spares  12\n";
        let (has, payload) = detect_table(tabular);
        assert!(has);
        assert!(payload.unwrap().contains("Trainer"));

        let prose = "This program element continues development of the\nhypersonic glide body.";
        let (has, payload) = detect_table(prose);
        assert!(!has);
        assert!(payload.is_none());
    }

    #[test]
    fn test_amount_field_to_column() {
        assert_eq!(
            amount_field_to_column("fy2025_total").as_deref(),
            Some("amount_fy2025_total")
        );
        assert_eq!(
            quantity_field_to_column("fy2025_qty").as_deref(),
            Some("qty_fy2025_qty")
        );
        assert_eq!(amount_field_to_column("organization"), None);
    }
}
