// Persisted schema and store access
//
// One SQLite database holds the fact table (budget_lines), the page
// table (document_pages), ingestion state, checkpoint sessions, the
// enrichment tables, and FTS5 mirrors of the searchable text columns.
// The fact and page tables are written by ingestion only; enrichment
// tables by the linker only; everything else reads.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::catalog::{amount_column, quantity_column, AMOUNT_KINDS, FISCAL_YEARS, QUANTITY_KINDS};

// ============================================================================
// ROW TYPES
// ============================================================================

/// One parsed data row of a budget document. Created by ingestion only
/// and never mutated in place; corrections arrive by re-ingesting the
/// corrected source file. Natural de-duplication key:
/// (source_file, exhibit_type, account, line_item, fiscal_year).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetLine {
    pub source_file: String,
    pub exhibit_type: String,
    /// Fiscal year of the document submission the row came from.
    pub fiscal_year: u16,
    pub budget_cycle: Option<String>,
    pub organization: Option<String>,
    pub account: String,
    pub account_title: Option<String>,
    pub line_item: String,
    pub line_item_title: Option<String>,
    pub program_element: Option<String>,
    pub element_title: Option<String>,
    pub amount_unit: Option<String>,
    /// Amount column name (e.g. "amount_fy2025_total") -> value.
    /// Absent keys persist as NULL.
    pub amounts: HashMap<String, f64>,
    /// Quantity column name (e.g. "qty_fy2025_qty") -> value.
    pub quantities: HashMap<String, f64>,
}

/// One extracted PDF page. Feeds full-text search and narrative mining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPage {
    pub source_file: String,
    pub page_number: u32,
    pub text: String,
    pub has_table: bool,
    /// Raw detected-table payload, when table extraction produced one.
    pub table_payload: Option<String>,
}

/// Per-file ingestion state. Drives incremental skip/reingest decisions:
/// status "ok" with matching (size, mtime, hash) is never reprocessed
/// unless a rebuild is forced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub file_path: String,
    pub file_size: u64,
    pub modified_time: i64,
    pub content_hash: String,
    pub row_count: i64,
    /// "ok" | "error:<reason>" | "pending"
    pub status: String,
    pub last_ingested: String,
}

impl IngestionRecord {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn is_error(&self) -> bool {
        self.status.starts_with("error:")
    }
}

/// Content hash used in ingestion state.
pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// SCHEMA
// ============================================================================

/// All amount column names in schema order.
pub fn all_amount_columns() -> Vec<String> {
    let mut cols = Vec::new();
    for fy in FISCAL_YEARS {
        for kind in AMOUNT_KINDS {
            cols.push(amount_column(*fy, kind));
        }
    }
    cols
}

/// All quantity column names in schema order.
pub fn all_quantity_columns() -> Vec<String> {
    let mut cols = Vec::new();
    for fy in FISCAL_YEARS {
        for kind in QUANTITY_KINDS {
            cols.push(quantity_column(*fy, kind));
        }
    }
    cols
}

/// Open a database, enable WAL, and create the schema if absent.
pub fn open_database(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery during long ingestion runs
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let numeric_cols: String = all_amount_columns()
        .iter()
        .chain(all_quantity_columns().iter())
        .map(|c| format!(",\n            {} REAL", c))
        .collect();

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS budget_lines (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_file TEXT NOT NULL,
            exhibit_type TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            budget_cycle TEXT,
            organization TEXT,
            account TEXT NOT NULL DEFAULT '',
            account_title TEXT,
            line_item TEXT NOT NULL DEFAULT '',
            line_item_title TEXT,
            program_element TEXT,
            element_title TEXT,
            amount_unit TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP{}
        )",
            numeric_cols
        ),
        [],
    )?;

    // Non-unique: duplicate natural keys must stay representable so the
    // validator can report them.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lines_natural_key
         ON budget_lines(source_file, exhibit_type, account, line_item, fiscal_year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lines_pe ON budget_lines(program_element)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lines_org ON budget_lines(organization)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS document_pages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_file TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            text TEXT NOT NULL,
            has_table INTEGER NOT NULL DEFAULT 0,
            table_payload TEXT,
            UNIQUE(source_file, page_number)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ingestion_state (
            file_path TEXT PRIMARY KEY,
            file_size INTEGER NOT NULL,
            modified_time INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            row_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            last_ingested TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS checkpoint_sessions (
            session_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS checkpoint_files (
            session_id TEXT NOT NULL,
            file_key TEXT NOT NULL,
            PRIMARY KEY (session_id, file_key)
        )",
        [],
    )?;

    // Enrichment tables: derived, rebuildable, never written by ingestion
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pe_index (
            program_element TEXT PRIMARY KEY,
            canonical_title TEXT NOT NULL,
            organization TEXT,
            budget_type TEXT,
            first_fiscal_year INTEGER,
            last_fiscal_year INTEGER,
            exhibit_types TEXT NOT NULL,
            total_amount REAL NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pe_tags (
            program_element TEXT NOT NULL,
            tag TEXT NOT NULL,
            tag_source TEXT NOT NULL,
            confidence REAL NOT NULL,
            source_files TEXT NOT NULL,
            UNIQUE(program_element, tag, tag_source)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pe_links (
            source_pe TEXT NOT NULL,
            referenced_pe TEXT NOT NULL,
            link_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            mention_count INTEGER NOT NULL DEFAULT 1,
            fiscal_year INTEGER,
            source_file TEXT,
            context_snippet TEXT,
            UNIQUE(source_pe, referenced_pe, link_type)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pe_descriptions (
            program_element TEXT NOT NULL,
            fiscal_year INTEGER,
            narrative TEXT NOT NULL,
            source_file TEXT,
            UNIQUE(program_element, fiscal_year)
        )",
        [],
    )?;

    // Optional reference lookup tables consumed by the referential
    // integrity check. Populated out of band; absence of rows disables
    // the check.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ref_organizations (name TEXT PRIMARY KEY)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ref_exhibit_types (key TEXT PRIMARY KEY)",
        [],
    )?;

    setup_fts(conn)?;
    create_fts_triggers(conn)?;

    Ok(())
}

/// Drop all per-table and index state for a forced rebuild. Every file is
/// treated as new afterward.
pub fn reset_database(conn: &Connection) -> Result<()> {
    drop_fts_triggers(conn)?;
    for table in [
        "budget_lines_fts",
        "document_pages_fts",
        "budget_lines",
        "document_pages",
        "ingestion_state",
        "checkpoint_sessions",
        "checkpoint_files",
        "pe_index",
        "pe_tags",
        "pe_links",
        "pe_descriptions",
    ] {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", table))?;
    }
    setup_database(conn)
}

// ============================================================================
// FULL-TEXT SEARCH
// ============================================================================

const LINE_FTS_COLUMNS: &[&str] = &[
    "organization",
    "account_title",
    "line_item_title",
    "program_element",
    "element_title",
];

fn setup_fts(conn: &Connection) -> Result<()> {
    conn.execute(
        &format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS budget_lines_fts USING fts5(
                {},
                content='budget_lines',
                content_rowid='id'
            )",
            LINE_FTS_COLUMNS.join(", ")
        ),
        [],
    )?;
    conn.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS document_pages_fts USING fts5(
            text,
            content='document_pages',
            content_rowid='id'
        )",
        [],
    )?;
    Ok(())
}

/// Arm the write-triggers that keep the FTS mirrors current. Bulk loads
/// drop these and rebuild once at the end instead.
pub fn create_fts_triggers(conn: &Connection) -> Result<()> {
    let cols = LINE_FTS_COLUMNS.join(", ");
    let new_cols = LINE_FTS_COLUMNS
        .iter()
        .map(|c| format!("new.{}", c))
        .collect::<Vec<_>>()
        .join(", ");
    let old_cols = LINE_FTS_COLUMNS
        .iter()
        .map(|c| format!("old.{}", c))
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute_batch(&format!(
        "CREATE TRIGGER IF NOT EXISTS budget_lines_ai AFTER INSERT ON budget_lines BEGIN
            INSERT INTO budget_lines_fts(rowid, {cols}) VALUES (new.id, {new_cols});
        END;
        CREATE TRIGGER IF NOT EXISTS budget_lines_ad AFTER DELETE ON budget_lines BEGIN
            INSERT INTO budget_lines_fts(budget_lines_fts, rowid, {cols})
            VALUES ('delete', old.id, {old_cols});
        END;
        CREATE TRIGGER IF NOT EXISTS budget_lines_au AFTER UPDATE ON budget_lines BEGIN
            INSERT INTO budget_lines_fts(budget_lines_fts, rowid, {cols})
            VALUES ('delete', old.id, {old_cols});
            INSERT INTO budget_lines_fts(rowid, {cols}) VALUES (new.id, {new_cols});
        END;
        CREATE TRIGGER IF NOT EXISTS document_pages_ai AFTER INSERT ON document_pages BEGIN
            INSERT INTO document_pages_fts(rowid, text) VALUES (new.id, new.text);
        END;
        CREATE TRIGGER IF NOT EXISTS document_pages_ad AFTER DELETE ON document_pages BEGIN
            INSERT INTO document_pages_fts(document_pages_fts, rowid, text)
            VALUES ('delete', old.id, old.text);
        END;"
    ))?;
    Ok(())
}

/// Suspend FTS maintenance for a bulk load.
pub fn drop_fts_triggers(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DROP TRIGGER IF EXISTS budget_lines_ai;
         DROP TRIGGER IF EXISTS budget_lines_ad;
         DROP TRIGGER IF EXISTS budget_lines_au;
         DROP TRIGGER IF EXISTS document_pages_ai;
         DROP TRIGGER IF EXISTS document_pages_ad;",
    )?;
    Ok(())
}

/// Rebuild both FTS mirrors from table content in one pass.
pub fn rebuild_fts(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT INTO budget_lines_fts(budget_lines_fts) VALUES('rebuild')",
        [],
    )?;
    conn.execute(
        "INSERT INTO document_pages_fts(document_pages_fts) VALUES('rebuild')",
        [],
    )?;
    Ok(())
}

/// Sanitize user input for an FTS5 MATCH expression: strip boolean
/// operators, wildcards, and punctuation, then emit OR-joined quoted
/// terms so arbitrary analyst input can never inject query syntax.
pub fn sanitize_match_query(input: &str) -> String {
    input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| {
            let upper = t.to_uppercase();
            !matches!(upper.as_str(), "AND" | "OR" | "NOT" | "NEAR")
        })
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Full-text search over fact rows, best matches first.
pub fn search_lines(conn: &Connection, query: &str, limit: usize) -> Result<Vec<BudgetLine>> {
    let sanitized = sanitize_match_query(query);
    if sanitized.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM budget_lines_fts f JOIN budget_lines b ON b.id = f.rowid
         WHERE budget_lines_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        line_select_columns()
            .iter()
            .map(|c| format!("b.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![sanitized, limit as i64])?;
    let mut lines = Vec::new();
    while let Some(row) = rows.next()? {
        lines.push(map_line_row(row)?.1);
    }
    Ok(lines)
}

/// One page-level full-text hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageHit {
    pub source_file: String,
    pub page_number: u32,
}

/// Full-text search over page text, best rank first.
pub fn search_pages(conn: &Connection, query: &str, limit: usize) -> Result<Vec<PageHit>> {
    let sanitized = sanitize_match_query(query);
    if sanitized.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT p.source_file, p.page_number
         FROM document_pages_fts f JOIN document_pages p ON p.id = f.rowid
         WHERE document_pages_fts MATCH ?1 ORDER BY rank LIMIT ?2",
    )?;
    let hits = stmt
        .query_map(params![sanitized, limit as i64], |row| {
            Ok(PageHit {
                source_file: row.get(0)?,
                page_number: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(hits)
}

// ============================================================================
// FACT TABLE WRITES
// ============================================================================

/// Insert a batch of fact rows inside one transaction. Existing rows for
/// a re-ingested file are removed by [`delete_lines_for_file`] first,
/// not here.
pub fn insert_budget_lines(conn: &mut Connection, lines: &[BudgetLine]) -> Result<usize> {
    let amount_cols = all_amount_columns();
    let qty_cols = all_quantity_columns();

    let mut columns: Vec<String> = vec![
        "source_file".into(),
        "exhibit_type".into(),
        "fiscal_year".into(),
        "budget_cycle".into(),
        "organization".into(),
        "account".into(),
        "account_title".into(),
        "line_item".into(),
        "line_item_title".into(),
        "program_element".into(),
        "element_title".into(),
        "amount_unit".into(),
    ];
    columns.extend(amount_cols.iter().cloned());
    columns.extend(qty_cols.iter().cloned());

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO budget_lines ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&sql)?;
        for line in lines {
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
                Box::new(line.source_file.clone()),
                Box::new(line.exhibit_type.clone()),
                Box::new(line.fiscal_year),
                Box::new(line.budget_cycle.clone()),
                Box::new(line.organization.clone()),
                Box::new(line.account.clone()),
                Box::new(line.account_title.clone()),
                Box::new(line.line_item.clone()),
                Box::new(line.line_item_title.clone()),
                Box::new(line.program_element.clone()),
                Box::new(line.element_title.clone()),
                Box::new(line.amount_unit.clone()),
            ];
            for col in &amount_cols {
                values.push(Box::new(line.amounts.get(col).copied()));
            }
            for col in &qty_cols {
                values.push(Box::new(line.quantities.get(col).copied()));
            }
            stmt.execute(rusqlite::params_from_iter(
                values.iter().map(|v| v.as_ref()),
            ))?;
        }
    }
    tx.commit()?;

    debug!(rows = lines.len(), "inserted fact rows");
    Ok(lines.len())
}

/// Remove all fact rows and pages for one source file ahead of
/// re-ingestion.
pub fn delete_lines_for_file(conn: &Connection, source_file: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM budget_lines WHERE source_file = ?1",
        params![source_file],
    )?;
    conn.execute(
        "DELETE FROM document_pages WHERE source_file = ?1",
        params![source_file],
    )?;
    Ok(())
}

pub fn insert_pages(conn: &mut Connection, pages: &[DocumentPage]) -> Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO document_pages
             (source_file, page_number, text, has_table, table_payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for page in pages {
            stmt.execute(params![
                page.source_file,
                page.page_number,
                page.text,
                page.has_table,
                page.table_payload,
            ])?;
        }
    }
    tx.commit()?;
    Ok(pages.len())
}

pub fn count_lines(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM budget_lines", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// INGESTION STATE
// ============================================================================

pub fn upsert_ingestion_record(conn: &Connection, record: &IngestionRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO ingestion_state
         (file_path, file_size, modified_time, content_hash, row_count, status, last_ingested)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(file_path) DO UPDATE SET
            file_size = excluded.file_size,
            modified_time = excluded.modified_time,
            content_hash = excluded.content_hash,
            row_count = excluded.row_count,
            status = excluded.status,
            last_ingested = excluded.last_ingested",
        params![
            record.file_path,
            record.file_size as i64,
            record.modified_time,
            record.content_hash,
            record.row_count,
            record.status,
            record.last_ingested,
        ],
    )?;
    Ok(())
}

pub fn get_ingestion_record(conn: &Connection, file_path: &str) -> Result<Option<IngestionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT file_path, file_size, modified_time, content_hash, row_count, status, last_ingested
         FROM ingestion_state WHERE file_path = ?1",
    )?;
    let mut rows = stmt.query_map(params![file_path], row_to_ingestion_record)?;
    match rows.next() {
        Some(record) => Ok(Some(record?)),
        None => Ok(None),
    }
}

pub fn list_ingestion_records(conn: &Connection) -> Result<Vec<IngestionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT file_path, file_size, modified_time, content_hash, row_count, status, last_ingested
         FROM ingestion_state ORDER BY file_path",
    )?;
    let records = stmt
        .query_map([], row_to_ingestion_record)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

fn row_to_ingestion_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestionRecord> {
    Ok(IngestionRecord {
        file_path: row.get(0)?,
        file_size: row.get::<_, i64>(1)? as u64,
        modified_time: row.get(2)?,
        content_hash: row.get(3)?,
        row_count: row.get(4)?,
        status: row.get(5)?,
        last_ingested: row.get(6)?,
    })
}

// ============================================================================
// BATCH CURSOR
// ============================================================================

/// Pull-based cursor over the fact table, yielding bounded batches so
/// callers control backpressure instead of buffering the whole table.
pub struct BatchCursor<'conn> {
    conn: &'conn Connection,
    batch_size: usize,
    last_id: i64,
    done: bool,
}

impl<'conn> BatchCursor<'conn> {
    pub fn new(conn: &'conn Connection, batch_size: usize) -> Self {
        BatchCursor {
            conn,
            batch_size: batch_size.max(1),
            last_id: 0,
            done: false,
        }
    }

    /// Fetch the next batch. Empty once the table is exhausted.
    pub fn next_batch(&mut self) -> Result<Vec<BudgetLine>> {
        if self.done {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {} FROM budget_lines WHERE id > ?1 ORDER BY id LIMIT ?2",
            line_select_columns().join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;

        let mut batch = Vec::new();
        let mut rows = stmt.query(params![self.last_id, self.batch_size as i64])?;
        while let Some(row) = rows.next()? {
            let (id, line) = map_line_row(row)?;
            self.last_id = id;
            batch.push(line);
        }

        if batch.len() < self.batch_size {
            self.done = true;
        }
        Ok(batch)
    }
}

/// Column order shared by every full-row SELECT: thirteen fixed columns
/// followed by every amount and quantity column.
fn line_select_columns() -> Vec<String> {
    let mut select: Vec<String> = vec![
        "id".into(),
        "source_file".into(),
        "exhibit_type".into(),
        "fiscal_year".into(),
        "budget_cycle".into(),
        "organization".into(),
        "account".into(),
        "account_title".into(),
        "line_item".into(),
        "line_item_title".into(),
        "program_element".into(),
        "element_title".into(),
        "amount_unit".into(),
    ];
    select.extend(all_amount_columns());
    select.extend(all_quantity_columns());
    select
}

fn map_line_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, BudgetLine)> {
    let amount_cols = all_amount_columns();
    let qty_cols = all_quantity_columns();
    let fixed = 13usize;

    let id: i64 = row.get(0)?;
    let mut amounts = HashMap::new();
    for (i, col) in amount_cols.iter().enumerate() {
        if let Some(v) = row.get::<_, Option<f64>>(fixed + i)? {
            amounts.insert(col.clone(), v);
        }
    }
    let mut quantities = HashMap::new();
    for (i, col) in qty_cols.iter().enumerate() {
        if let Some(v) = row.get::<_, Option<f64>>(fixed + amount_cols.len() + i)? {
            quantities.insert(col.clone(), v);
        }
    }

    Ok((
        id,
        BudgetLine {
            source_file: row.get(1)?,
            exhibit_type: row.get(2)?,
            fiscal_year: row.get::<_, i64>(3)? as u16,
            budget_cycle: row.get(4)?,
            organization: row.get(5)?,
            account: row.get(6)?,
            account_title: row.get(7)?,
            line_item: row.get(8)?,
            line_item_title: row.get(9)?,
            program_element: row.get(10)?,
            element_title: row.get(11)?,
            amount_unit: row.get(12)?,
            amounts,
            quantities,
        },
    ))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Shared fixture: a plausible procurement-summary row.
    pub(crate) fn test_line(source: &str, account: &str, item: &str, fy2025: f64) -> BudgetLine {
        let mut amounts = HashMap::new();
        amounts.insert(amount_column(2025, "total"), fy2025);
        BudgetLine {
            source_file: source.to_string(),
            exhibit_type: "procurement-summary".to_string(),
            fiscal_year: 2025,
            budget_cycle: Some("base-request".to_string()),
            organization: Some("Navy".to_string()),
            account: account.to_string(),
            account_title: Some("Aircraft Procurement".to_string()),
            line_item: item.to_string(),
            line_item_title: Some("F/A-18 Squadrons".to_string()),
            program_element: None,
            element_title: None,
            amount_unit: Some("thousands".to_string()),
            amounts,
            quantities: HashMap::new(),
        }
    }

    pub(crate) fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_and_count() {
        let mut conn = memory_db();
        let lines = vec![
            test_line("navy_p1.xlsx", "1506N", "0101", 100.0),
            test_line("navy_p1.xlsx", "1506N", "0102", 200.0),
        ];
        assert_eq!(insert_budget_lines(&mut conn, &lines).unwrap(), 2);
        assert_eq!(count_lines(&conn).unwrap(), 2);

        delete_lines_for_file(&conn, "navy_p1.xlsx").unwrap();
        assert_eq!(count_lines(&conn).unwrap(), 0);
    }

    #[test]
    fn test_fts_triggers_keep_index_current() {
        let mut conn = memory_db();
        insert_budget_lines(&mut conn, &[test_line("navy_p1.xlsx", "1506N", "0101", 1.0)])
            .unwrap();

        let hits = search_lines(&conn, "squadrons", 10).unwrap();
        assert_eq!(hits.len(), 1);

        delete_lines_for_file(&conn, "navy_p1.xlsx").unwrap();
        assert!(search_lines(&conn, "squadrons", 10).unwrap().is_empty());
    }

    #[test]
    fn test_bulk_load_with_suspended_triggers() {
        let mut conn = memory_db();
        drop_fts_triggers(&conn).unwrap();
        insert_budget_lines(&mut conn, &[test_line("navy_p1.xlsx", "1506N", "0101", 1.0)])
            .unwrap();
        // Index is stale until the rebuild.
        assert!(search_lines(&conn, "squadrons", 10).unwrap().is_empty());

        rebuild_fts(&conn).unwrap();
        create_fts_triggers(&conn).unwrap();
        assert_eq!(search_lines(&conn, "squadrons", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_sanitize_match_query() {
        assert_eq!(
            sanitize_match_query("hypersonic missile"),
            "\"hypersonic\" OR \"missile\""
        );
        assert_eq!(
            sanitize_match_query("a AND b OR c NOT d"),
            "\"a\" OR \"b\" OR \"c\" OR \"d\""
        );
        assert_eq!(
            sanitize_match_query("f-35* (block 4)"),
            "\"f\" OR \"35\" OR \"block\" OR \"4\""
        );
        assert_eq!(sanitize_match_query("\"quoted\""), "\"quoted\"");
        assert_eq!(sanitize_match_query("   "), "");
    }

    #[test]
    fn test_page_search() {
        let mut conn = memory_db();
        insert_pages(
            &mut conn,
            &[DocumentPage {
                source_file: "army_r2.pdf".to_string(),
                page_number: 7,
                text: "This program element funds hypersonic glide research".to_string(),
                has_table: false,
                table_payload: None,
            }],
        )
        .unwrap();

        let hits = search_pages(&conn, "hypersonic", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_file, "army_r2.pdf");
        assert_eq!(hits[0].page_number, 7);
    }

    #[test]
    fn test_ingestion_record_round_trip() {
        let conn = memory_db();
        let record = IngestionRecord {
            file_path: "/docs/navy_p1.xlsx".to_string(),
            file_size: 4096,
            modified_time: 1_700_000_000,
            content_hash: "abc123".to_string(),
            row_count: 42,
            status: "ok".to_string(),
            last_ingested: "2026-01-01T00:00:00Z".to_string(),
        };
        upsert_ingestion_record(&conn, &record).unwrap();

        let loaded = get_ingestion_record(&conn, "/docs/navy_p1.xlsx")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.row_count, 42);
        assert!(loaded.is_ok());

        // Upsert replaces
        let mut errored = record.clone();
        errored.status = "error:corrupt".to_string();
        upsert_ingestion_record(&conn, &errored).unwrap();
        let loaded = get_ingestion_record(&conn, "/docs/navy_p1.xlsx")
            .unwrap()
            .unwrap();
        assert!(loaded.is_error());
        assert_eq!(list_ingestion_records(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_batch_cursor_bounded_batches() {
        let mut conn = memory_db();
        let lines: Vec<BudgetLine> = (0..7)
            .map(|i| test_line("navy_p1.xlsx", "1506N", &format!("{:04}", i), i as f64))
            .collect();
        insert_budget_lines(&mut conn, &lines).unwrap();

        let mut cursor = BatchCursor::new(&conn, 3);
        let sizes: Vec<usize> = std::iter::from_fn(|| {
            let batch = cursor.next_batch().unwrap();
            (!batch.is_empty()).then_some(batch.len())
        })
        .collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let batch = cursor.next_batch().unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_amounts_survive_round_trip() {
        let mut conn = memory_db();
        insert_budget_lines(&mut conn, &[test_line("navy_p1.xlsx", "1506N", "0101", 123.5)])
            .unwrap();

        let mut cursor = BatchCursor::new(&conn, 10);
        let batch = cursor.next_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0].amounts.get(&amount_column(2025, "total")),
            Some(&123.5)
        );
        assert!(batch[0]
            .amounts
            .get(&amount_column(2024, "total"))
            .is_none());
    }
}
