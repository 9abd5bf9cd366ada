// Enrichment & lineage linker
//
// Derived views over the fact store: a program-element index, tags from
// three provenance classes, narrative descriptions mined from document
// pages, and confidence-scored lineage links between program elements.
// Never writes to budget_lines or document_pages; rebuild clears and
// regenerates everything, incremental mode touches only program elements
// newly observed since the last run.

use anyhow::{Context, Result};
use regex::Regex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::cache::TtlCache;
use crate::classify;
use crate::db;
use crate::error::BudgetlineError;

pub const CONFIDENCE_STRUCTURED: f64 = 1.0;
pub const CONFIDENCE_KEYWORD: f64 = 0.8;
pub const CONFIDENCE_ASSISTED: f64 = 0.5;
pub const CONFIDENCE_EXPLICIT_REF: f64 = 0.95;
pub const CONFIDENCE_NAME_MATCH: f64 = 0.6;

/// Keyword tags matched case-insensitively against narrative and title text.
const KEYWORD_TAGS: &[(&str, &str)] = &[
    ("hypersonics", r"(?i)\bhypersonic"),
    ("artificial-intelligence", r"(?i)\bartificial intelligence\b|\bmachine learning\b"),
    ("cyber", r"(?i)\bcyber"),
    ("space", r"(?i)\bsatellite|\bspace-based|\bspace launch"),
    ("nuclear", r"(?i)\bnuclear"),
    ("unmanned", r"(?i)\bunmanned|\bautonomous"),
    ("missile-defense", r"(?i)\bmissile defense\b|\binterceptor"),
    ("shipbuilding", r"(?i)\bshipbuilding\b|\bsubmarine\b|\bdestroyer\b"),
];

/// Program-element numbers as they appear in narrative text.
fn pe_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{7}[A-Z]{1,3})\b").unwrap())
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramElementEntry {
    pub program_element: String,
    pub canonical_title: String,
    pub organization: Option<String>,
    pub budget_type: Option<String>,
    pub first_fiscal_year: Option<u16>,
    pub last_fiscal_year: Option<u16>,
    pub exhibit_types: Vec<String>,
    pub total_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageLink {
    pub source_pe: String,
    pub referenced_pe: String,
    pub link_type: String,
    pub confidence: f64,
    pub mention_count: i64,
    pub fiscal_year: Option<u16>,
    pub source_file: Option<String>,
    pub context_snippet: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub elements_indexed: usize,
    pub tags_created: usize,
    pub descriptions_mined: usize,
    pub links_detected: usize,
    /// Non-fatal integrity stats, reported rather than enforced.
    pub index_miss_fraction: f64,
    pub described_fraction: f64,
    pub zero_tags: bool,
}

pub struct EnrichmentEngine;

/// Enrich the store at `db_path`.
pub fn enrich(db_path: &Path, rebuild: bool) -> Result<EnrichmentSummary> {
    if !db_path.is_file() {
        return Err(BudgetlineError::precondition(format!(
            "database does not exist: {}",
            db_path.display()
        ))
        .into());
    }
    let conn = db::open_database(db_path)?;
    EnrichmentEngine.run(&conn, rebuild)
}

impl EnrichmentEngine {
    pub fn run(&self, conn: &Connection, rebuild: bool) -> Result<EnrichmentSummary> {
        if rebuild {
            info!("rebuilding enrichment tables");
            for table in ["pe_index", "pe_tags", "pe_links", "pe_descriptions"] {
                conn.execute(&format!("DELETE FROM {}", table), [])?;
            }
        }

        let targets = self.target_elements(conn, rebuild)?;
        info!(elements = targets.len(), rebuild, "enrichment targets");

        let mut summary = EnrichmentSummary::default();
        summary.elements_indexed = self.build_index(conn, &targets).context("building index")?;
        summary.descriptions_mined = self
            .mine_descriptions(conn, &targets)
            .context("mining descriptions")?;
        summary.tags_created = self.derive_tags(conn, &targets).context("deriving tags")?;
        summary.links_detected = self.detect_links(conn).context("detecting links")?;

        self.integrity_stats(conn, &mut summary)?;
        info!(
            indexed = summary.elements_indexed,
            tags = summary.tags_created,
            descriptions = summary.descriptions_mined,
            links = summary.links_detected,
            "enrichment complete"
        );
        Ok(summary)
    }

    /// Incremental mode: only program elements in the fact table that
    /// the index has not seen yet.
    fn target_elements(&self, conn: &Connection, rebuild: bool) -> Result<Vec<String>> {
        let sql = if rebuild {
            "SELECT DISTINCT program_element FROM budget_lines
             WHERE program_element IS NOT NULL AND program_element != ''
             ORDER BY program_element"
        } else {
            "SELECT DISTINCT program_element FROM budget_lines
             WHERE program_element IS NOT NULL AND program_element != ''
               AND program_element NOT IN (SELECT program_element FROM pe_index)
             ORDER BY program_element"
        };
        let mut stmt = conn.prepare(sql)?;
        let targets = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    /// One index row per program element. Canonical title is the title
    /// of the highest-total-funding line; ties break to the
    /// lexicographically smallest title so rebuilds are reproducible.
    fn build_index(&self, conn: &Connection, targets: &[String]) -> Result<usize> {
        let amount_sum = db::all_amount_columns()
            .iter()
            .map(|c| format!("COALESCE({}, 0)", c))
            .collect::<Vec<_>>()
            .join(" + ");

        let mut indexed = 0;
        for pe in targets {
            let mut stmt = conn.prepare(&format!(
                "SELECT COALESCE(element_title, line_item_title, account_title, ''),
                        organization, exhibit_type, fiscal_year, {} AS line_total
                 FROM budget_lines WHERE program_element = ?1",
                amount_sum
            ))?;
            let rows = stmt.query_map(params![pe], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)? as u16,
                    row.get::<_, f64>(4)?,
                ))
            })?;

            let mut best: Option<(f64, String, Option<String>)> = None;
            let mut exhibits = BTreeSet::new();
            let mut first_fy: Option<u16> = None;
            let mut last_fy: Option<u16> = None;
            let mut total = 0.0;
            for row in rows {
                let (title, org, exhibit, fy, line_total) = row?;
                exhibits.insert(exhibit);
                first_fy = Some(first_fy.map_or(fy, |f| f.min(fy)));
                last_fy = Some(last_fy.map_or(fy, |f| f.max(fy)));
                total += line_total;
                let better = match &best {
                    None => true,
                    Some((best_total, best_title, _)) => {
                        line_total > *best_total
                            || (line_total == *best_total && title < *best_title)
                    }
                };
                if better {
                    best = Some((line_total, title, org));
                }
            }
            let Some((_, canonical_title, organization)) = best else { continue };

            let budget_type = exhibits
                .iter()
                .next()
                .map(|e| e.split('-').next().unwrap_or(e).to_string());
            let exhibit_list =
                serde_json::to_string(&exhibits.iter().collect::<Vec<_>>())?;
            conn.execute(
                "INSERT INTO pe_index (program_element, canonical_title, organization,
                     budget_type, first_fiscal_year, last_fiscal_year, exhibit_types, total_amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(program_element) DO UPDATE SET
                     canonical_title = excluded.canonical_title,
                     organization = excluded.organization,
                     budget_type = excluded.budget_type,
                     first_fiscal_year = excluded.first_fiscal_year,
                     last_fiscal_year = excluded.last_fiscal_year,
                     exhibit_types = excluded.exhibit_types,
                     total_amount = excluded.total_amount",
                params![
                    pe,
                    canonical_title,
                    organization,
                    budget_type,
                    first_fy,
                    last_fy,
                    exhibit_list,
                    total
                ],
            )?;
            indexed += 1;
        }
        Ok(indexed)
    }

    /// Pages mentioning a program element contribute its narrative. One
    /// description per (element, fiscal year); the fiscal year comes
    /// from the source path when it carries one.
    fn mine_descriptions(&self, conn: &Connection, targets: &[String]) -> Result<usize> {
        if targets.is_empty() {
            return Ok(0);
        }
        let wanted: HashSet<&str> = targets.iter().map(|s| s.as_str()).collect();

        let mut stmt = conn.prepare(
            "SELECT source_file, text FROM document_pages WHERE LENGTH(text) > 0",
        )?;
        let pages = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut mined = 0;
        for page in pages {
            let (source_file, text) = page?;
            let fiscal_year = fiscal_year_from_path(&source_file);
            for cap in pe_pattern().captures_iter(&text) {
                let pe = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
                if !wanted.contains(pe) {
                    continue;
                }
                let narrative = snippet(&text, cap.get(0).map(|m| m.start()).unwrap_or(0), 400);
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO pe_descriptions
                         (program_element, fiscal_year, narrative, source_file)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![pe, fiscal_year, narrative, source_file],
                )?;
                mined += changed;
            }
        }
        Ok(mined)
    }

    /// Three provenance classes: structured tags straight from catalog
    /// fields (1.0), keyword matches against narrative and titles (0.8),
    /// and an assisted heuristic from account-title words (0.5).
    fn derive_tags(&self, conn: &Connection, targets: &[String]) -> Result<usize> {
        let keyword_res: Vec<(&str, Regex)> = KEYWORD_TAGS
            .iter()
            .map(|&(tag, pat)| (tag, Regex::new(pat).unwrap()))
            .collect();

        let mut created = 0;
        for pe in targets {
            let mut stmt = conn.prepare(
                "SELECT organization, exhibit_type, budget_cycle, account_title,
                        COALESCE(element_title, line_item_title, ''), source_file
                 FROM budget_lines WHERE program_element = ?1",
            )?;
            let rows = stmt.query_map(params![pe], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            // tag -> (source class, confidence, contributing files)
            let mut tags: BTreeMap<(String, &str), (f64, BTreeSet<String>)> = BTreeMap::new();
            let mut title_text = String::new();
            for row in rows {
                let (org, exhibit, cycle, account_title, title, file) = row?;
                if let Some(org) = org {
                    tags.entry((format!("org:{}", slug(&org)), "structured"))
                        .or_insert((CONFIDENCE_STRUCTURED, BTreeSet::new()))
                        .1
                        .insert(file.clone());
                }
                tags.entry((format!("exhibit:{}", exhibit), "structured"))
                    .or_insert((CONFIDENCE_STRUCTURED, BTreeSet::new()))
                    .1
                    .insert(file.clone());
                if let Some(cycle) = cycle {
                    tags.entry((format!("cycle:{}", cycle), "structured"))
                        .or_insert((CONFIDENCE_STRUCTURED, BTreeSet::new()))
                        .1
                        .insert(file.clone());
                }
                if let Some(account_title) = account_title {
                    for word in account_title.split_whitespace() {
                        let word = slug(word);
                        if word.len() >= 6 {
                            tags.entry((format!("account:{}", word), "assisted"))
                                .or_insert((CONFIDENCE_ASSISTED, BTreeSet::new()))
                                .1
                                .insert(file.clone());
                        }
                    }
                }
                title_text.push_str(&title);
                title_text.push('\n');
            }

            // Narrative text joins the titles for keyword matching.
            let narrative: String = conn
                .prepare("SELECT narrative FROM pe_descriptions WHERE program_element = ?1")?
                .query_map(params![pe], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .join("\n");
            let haystack = format!("{}\n{}", title_text, narrative);
            for (tag, re) in &keyword_res {
                if re.is_match(&haystack) {
                    tags.entry((format!("topic:{}", tag), "keyword"))
                        .or_insert((CONFIDENCE_KEYWORD, BTreeSet::new()));
                }
            }

            for ((tag, source), (confidence, files)) in tags {
                let file_list = serde_json::to_string(&files.iter().collect::<Vec<_>>())?;
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO pe_tags
                         (program_element, tag, tag_source, confidence, source_files)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![pe, tag, source, confidence, file_list],
                )?;
                created += changed;
            }
        }
        Ok(created)
    }

    /// Two signal types. Explicit reference: a program-element number
    /// appears verbatim in another element's narrative. Name match:
    /// normalized canonical titles coincide across organizations.
    /// Evidence for one directed (source, referenced, type) triple
    /// collapses to a single link keeping max confidence and a count.
    fn detect_links(&self, conn: &Connection) -> Result<usize> {
        let mut stmt =
            conn.prepare("SELECT program_element, canonical_title, organization FROM pe_index")?;
        let index: Vec<(String, String, Option<String>)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        let known: HashSet<&str> = index.iter().map(|(pe, _, _)| pe.as_str()).collect();

        // (source, referenced, type) -> (confidence, mentions, fy, file, snippet)
        type Evidence = (f64, i64, Option<i64>, Option<String>, Option<String>);
        let mut links: HashMap<(String, String, &str), Evidence> = HashMap::new();

        let mut stmt = conn.prepare(
            "SELECT program_element, fiscal_year, narrative, source_file FROM pe_descriptions",
        )?;
        let descriptions = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        for desc in descriptions {
            let (source_pe, fiscal_year, narrative, source_file) = desc?;
            for cap in pe_pattern().captures_iter(&narrative) {
                let referenced = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
                if referenced == source_pe || !known.contains(referenced) {
                    continue;
                }
                let ctx = snippet(&narrative, cap.get(0).map(|m| m.start()).unwrap_or(0), 120);
                let entry = links
                    .entry((source_pe.clone(), referenced.to_string(), "explicit_reference"))
                    .or_insert((
                        CONFIDENCE_EXPLICIT_REF,
                        0,
                        fiscal_year,
                        source_file.clone(),
                        Some(ctx),
                    ));
                entry.1 += 1;
            }
        }

        let mut by_title: BTreeMap<String, Vec<&(String, String, Option<String>)>> =
            BTreeMap::new();
        for entry in &index {
            let norm = normalize_title(&entry.1);
            if !norm.is_empty() {
                by_title.entry(norm).or_default().push(entry);
            }
        }
        for entries in by_title.values() {
            if entries.len() < 2 {
                continue;
            }
            for a in entries.iter() {
                for b in entries.iter() {
                    if a.0 == b.0 || a.2 == b.2 {
                        continue;
                    }
                    let entry = links
                        .entry((a.0.clone(), b.0.clone(), "name_match"))
                        .or_insert((CONFIDENCE_NAME_MATCH, 0, None, None, None));
                    entry.1 += 1;
                }
            }
        }

        // Each run recomputes the full evidence set, so the stored count
        // is replaced, not accumulated; re-running over unchanged data
        // must not inflate it.
        let mut detected = 0;
        for ((source, referenced, link_type), (confidence, mentions, fy, file, ctx)) in links {
            conn.execute(
                "INSERT INTO pe_links
                     (source_pe, referenced_pe, link_type, confidence, mention_count,
                      fiscal_year, source_file, context_snippet)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(source_pe, referenced_pe, link_type) DO UPDATE SET
                     confidence = MAX(confidence, excluded.confidence),
                     mention_count = excluded.mention_count,
                     fiscal_year = excluded.fiscal_year,
                     source_file = excluded.source_file,
                     context_snippet = excluded.context_snippet",
                params![source, referenced, link_type, confidence, mentions, fy, file, ctx],
            )?;
            detected += 1;
        }
        Ok(detected)
    }

    /// Report-only integrity stats. A high index-miss fraction or a
    /// tagless run points at upstream extraction problems, not at a
    /// failure here.
    fn integrity_stats(&self, conn: &Connection, summary: &mut EnrichmentSummary) -> Result<()> {
        let fact_pes: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT program_element) FROM budget_lines
             WHERE program_element IS NOT NULL AND program_element != ''",
            [],
            |r| r.get(0),
        )?;
        let missing: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT program_element) FROM budget_lines
             WHERE program_element IS NOT NULL AND program_element != ''
               AND program_element NOT IN (SELECT program_element FROM pe_index)",
            [],
            |r| r.get(0),
        )?;
        summary.index_miss_fraction = if fact_pes == 0 {
            0.0
        } else {
            missing as f64 / fact_pes as f64
        };

        let indexed: i64 = conn.query_row("SELECT COUNT(*) FROM pe_index", [], |r| r.get(0))?;
        let described: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT program_element) FROM pe_descriptions
             WHERE program_element IN (SELECT program_element FROM pe_index)",
            [],
            |r| r.get(0),
        )?;
        summary.described_fraction = if indexed == 0 {
            0.0
        } else {
            described as f64 / indexed as f64
        };

        let tags: i64 = conn.query_row("SELECT COUNT(*) FROM pe_tags", [], |r| r.get(0))?;
        if summary.index_miss_fraction > 0.0 {
            warn!(
                fraction = summary.index_miss_fraction,
                "program elements missing from index"
            );
        }
        summary.zero_tags = indexed > 0 && tags == 0;
        if summary.zero_tags {
            warn!("enrichment produced no tags");
        }
        Ok(())
    }
}

/// Lineage links into one program element, highest confidence first.
pub fn links_to(conn: &Connection, referenced_pe: &str) -> Result<Vec<LineageLink>> {
    let mut stmt = conn.prepare(
        "SELECT source_pe, referenced_pe, link_type, confidence, mention_count,
                fiscal_year, source_file, context_snippet
         FROM pe_links WHERE referenced_pe = ?1
         ORDER BY confidence DESC, source_pe",
    )?;
    let links = stmt
        .query_map(params![referenced_pe], |row| {
            Ok(LineageLink {
                source_pe: row.get(0)?,
                referenced_pe: row.get(1)?,
                link_type: row.get(2)?,
                confidence: row.get(3)?,
                mention_count: row.get(4)?,
                fiscal_year: row.get::<_, Option<i64>>(5)?.map(|v| v as u16),
                source_file: row.get(6)?,
                context_snippet: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(links)
}

/// Cache-backed variant of [`links_to`] for callers issuing repeated lookups.
/// The caller owns the cache and decides when to invalidate.
pub fn links_to_cached(
    conn: &Connection,
    cache: &mut TtlCache<String, Vec<LineageLink>>,
    referenced_pe: &str,
) -> Result<Vec<LineageLink>> {
    if let Some(links) = cache.get(&referenced_pe.to_string()) {
        return Ok(links);
    }
    let links = links_to(conn, referenced_pe)?;
    cache.insert(referenced_pe.to_string(), links.clone());
    Ok(links)
}

/// Look up one program element's index entry.
pub fn index_entry(conn: &Connection, program_element: &str) -> Result<Option<ProgramElementEntry>> {
    use rusqlite::OptionalExtension;
    let entry = conn
        .query_row(
            "SELECT program_element, canonical_title, organization, budget_type,
                    first_fiscal_year, last_fiscal_year, exhibit_types, total_amount
             FROM pe_index WHERE program_element = ?1",
            params![program_element],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                ))
            },
        )
        .optional()?;
    let Some((pe, title, org, budget_type, first, last, exhibits_raw, total)) = entry else {
        return Ok(None);
    };
    Ok(Some(ProgramElementEntry {
        program_element: pe,
        canonical_title: title,
        organization: org,
        budget_type,
        first_fiscal_year: first.map(|v| v as u16),
        last_fiscal_year: last.map(|v| v as u16),
        exhibit_types: serde_json::from_str(&exhibits_raw).unwrap_or_default(),
        total_amount: total,
    }))
}

fn fiscal_year_from_path(source_file: &str) -> Option<u16> {
    source_file
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(classify::parse_fiscal_year)
}

fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn slug(word: &str) -> String {
    word.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Window of `width` chars starting near a byte offset, on char
/// boundaries.
fn snippet(text: &str, around: usize, width: usize) -> String {
    let start = text[..around.min(text.len())]
        .char_indices()
        .rev()
        .nth(width / 4)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..]
        .chars()
        .take(width)
        .collect::<String>()
        .trim()
        .to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{memory_db, test_line};

    fn rdte_line(pe: &str, title: &str, org: &str, total: f64) -> db::BudgetLine {
        let mut line = test_line(&format!("{}_r2_fy2025.xlsx", org.to_lowercase()), "2040", pe, total);
        line.exhibit_type = "rdte-detail".to_string();
        line.organization = Some(org.to_string());
        line.program_element = Some(pe.to_string());
        line.element_title = Some(title.to_string());
        line
    }

    fn page(source: &str, n: u32, text: &str) -> db::DocumentPage {
        db::DocumentPage {
            source_file: source.to_string(),
            page_number: n,
            text: text.to_string(),
            has_table: false,
            table_payload: None,
        }
    }

    #[test]
    fn test_index_canonical_title_highest_funding_wins() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[
                rdte_line("0604123N", "Hypersonic Strike Weapon", "Navy", 900.0),
                {
                    let mut l = rdte_line("0604123N", "HSW (Legacy Name)", "Navy", 100.0);
                    l.line_item = "0102".to_string();
                    l
                },
            ],
        )
        .unwrap();

        EnrichmentEngine.run(&conn, false).unwrap();
        let title: String = conn
            .query_row(
                "SELECT canonical_title FROM pe_index WHERE program_element = '0604123N'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(title, "Hypersonic Strike Weapon");
    }

    #[test]
    fn test_index_title_tie_breaks_lexicographically() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[
                rdte_line("0604123N", "Zeta Title", "Navy", 100.0),
                {
                    let mut l = rdte_line("0604123N", "Alpha Title", "Navy", 100.0);
                    l.line_item = "0102".to_string();
                    l
                },
            ],
        )
        .unwrap();

        EnrichmentEngine.run(&conn, false).unwrap();
        let title: String = conn
            .query_row(
                "SELECT canonical_title FROM pe_index WHERE program_element = '0604123N'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(title, "Alpha Title");
    }

    #[test]
    fn test_incremental_skips_indexed_elements() {
        let mut conn = memory_db();
        db::insert_budget_lines(&mut conn, &[rdte_line("0604123N", "First", "Navy", 10.0)])
            .unwrap();
        let first = EnrichmentEngine.run(&conn, false).unwrap();
        assert_eq!(first.elements_indexed, 1);

        db::insert_budget_lines(&mut conn, &[rdte_line("0604999A", "Second", "Army", 20.0)])
            .unwrap();
        let second = EnrichmentEngine.run(&conn, false).unwrap();
        assert_eq!(second.elements_indexed, 1);

        let rebuild = EnrichmentEngine.run(&conn, true).unwrap();
        assert_eq!(rebuild.elements_indexed, 2);

        let entry = index_entry(&conn, "0604999A").unwrap().unwrap();
        assert_eq!(entry.canonical_title, "Second");
        assert_eq!(entry.first_fiscal_year, Some(2025));
        assert_eq!(entry.exhibit_types, vec!["rdte-detail".to_string()]);
        assert!(index_entry(&conn, "0000000X").unwrap().is_none());
    }

    #[test]
    fn test_structured_and_keyword_tags() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[rdte_line("0604123N", "Hypersonic Strike Weapon", "Navy", 10.0)],
        )
        .unwrap();
        let summary = EnrichmentEngine.run(&conn, false).unwrap();
        assert!(!summary.zero_tags);

        let tag_of = |tag: &str| -> Option<(String, f64)> {
            conn.query_row(
                "SELECT tag_source, confidence FROM pe_tags
                 WHERE program_element = '0604123N' AND tag = ?1",
                params![tag],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .ok()
        };
        assert_eq!(
            tag_of("org:navy"),
            Some(("structured".to_string(), CONFIDENCE_STRUCTURED))
        );
        assert_eq!(
            tag_of("topic:hypersonics"),
            Some(("keyword".to_string(), CONFIDENCE_KEYWORD))
        );
        let assisted = tag_of("account:aircraft");
        assert_eq!(
            assisted,
            Some(("assisted".to_string(), CONFIDENCE_ASSISTED))
        );
    }

    #[test]
    fn test_zero_tag_flag_reported() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[rdte_line("0604123N", "Hypersonic Strike Weapon", "Navy", 10.0)],
        )
        .unwrap();
        EnrichmentEngine.run(&conn, false).unwrap();

        // An indexed store whose tags vanished must flag it.
        conn.execute("DELETE FROM pe_tags", []).unwrap();
        let mut summary = EnrichmentSummary::default();
        EnrichmentEngine.integrity_stats(&conn, &mut summary).unwrap();
        assert!(summary.zero_tags);
    }

    #[test]
    fn test_descriptions_mined_from_pages() {
        let mut conn = memory_db();
        db::insert_budget_lines(&mut conn, &[rdte_line("0604123N", "HSW", "Navy", 10.0)])
            .unwrap();
        db::insert_pages(
            &mut conn,
            &[page(
                "navy_r2_fy2025.pdf",
                1,
                "PE 0604123N continues development of the hypersonic glide body.",
            )],
        )
        .unwrap();

        let summary = EnrichmentEngine.run(&conn, false).unwrap();
        assert_eq!(summary.descriptions_mined, 1);
        assert!(summary.described_fraction > 0.99);

        let (fy, narrative): (Option<u16>, String) = conn
            .query_row(
                "SELECT fiscal_year, narrative FROM pe_descriptions
                 WHERE program_element = '0604123N'",
                [],
                |r| Ok((r.get::<_, Option<i64>>(0)?.map(|v| v as u16), r.get(1)?)),
            )
            .unwrap();
        assert_eq!(fy, Some(2025));
        assert!(narrative.contains("hypersonic glide body"));
    }

    #[test]
    fn test_explicit_and_name_links_ordered_by_confidence() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[
                rdte_line("0604123N", "Common Guidance Section", "Navy", 10.0),
                rdte_line("0604500A", "Common Guidance Section", "Army", 20.0),
                rdte_line("0604777F", "Airborne Sensor", "Air Force", 30.0),
            ],
        )
        .unwrap();
        // 0604777F's narrative references 0604500A explicitly, twice.
        db::insert_pages(
            &mut conn,
            &[page(
                "af_r2_fy2025.pdf",
                1,
                "PE 0604777F leverages the seeker developed under 0604500A; \
                 integration with 0604500A completes in FY 2026. Effort 0604777F continues.",
            )],
        )
        .unwrap();

        EnrichmentEngine.run(&conn, false).unwrap();

        let links = links_to(&conn, "0604500A").unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].link_type, "explicit_reference");
        assert!((links[0].confidence - CONFIDENCE_EXPLICIT_REF).abs() < 1e-9);
        assert_eq!(links[0].mention_count, 2);
        // Explicit links carry their evidence provenance.
        assert_eq!(links[0].source_file.as_deref(), Some("af_r2_fy2025.pdf"));
        assert_eq!(links[0].fiscal_year, Some(2025));
        assert_eq!(links[1].link_type, "name_match");
        assert!((links[1].confidence - CONFIDENCE_NAME_MATCH).abs() < 1e-9);
    }

    #[test]
    fn test_rerun_over_unchanged_data_keeps_counts_stable() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[
                rdte_line("0604123N", "Seeker Integration", "Navy", 10.0),
                rdte_line("0604500A", "Terminal Guidance", "Army", 20.0),
            ],
        )
        .unwrap();
        db::insert_pages(
            &mut conn,
            &[page(
                "navy_r2_fy2025.pdf",
                1,
                "PE 0604123N carries the seeker qualified under 0604500A forward.",
            )],
        )
        .unwrap();

        EnrichmentEngine.run(&conn, false).unwrap();
        let first = links_to(&conn, "0604500A").unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].mention_count, 1);

        // A second incremental pass over identical data is a no-op for
        // the evidence count.
        EnrichmentEngine.run(&conn, false).unwrap();
        let second = links_to(&conn, "0604500A").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].mention_count, 1);
    }

    #[test]
    fn test_cached_link_lookup_serves_stale_until_invalidated() {
        let mut conn = memory_db();
        db::insert_budget_lines(
            &mut conn,
            &[
                rdte_line("0604123N", "Common Guidance Section", "Navy", 10.0),
                rdte_line("0604500A", "Common Guidance Section", "Army", 20.0),
            ],
        )
        .unwrap();
        EnrichmentEngine.run(&conn, false).unwrap();

        let mut cache = TtlCache::new(std::time::Duration::from_secs(60));
        let first = links_to_cached(&conn, &mut cache, "0604500A").unwrap();
        assert_eq!(first.len(), 1);

        // A new underlying link is invisible until the caller invalidates.
        conn.execute(
            "INSERT INTO pe_links
             (source_pe, referenced_pe, link_type, confidence, mention_count)
             VALUES ('0604777F', '0604500A', 'explicit_reference', 0.95, 1)",
            [],
        )
        .unwrap();
        let cached = links_to_cached(&conn, &mut cache, "0604500A").unwrap();
        assert_eq!(cached.len(), 1);

        cache.invalidate(&"0604500A".to_string());
        let fresh = links_to_cached(&conn, &mut cache, "0604500A").unwrap();
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn test_enrichment_never_touches_fact_tables() {
        let mut conn = memory_db();
        db::insert_budget_lines(&mut conn, &[rdte_line("0604123N", "HSW", "Navy", 10.0)])
            .unwrap();
        let before = db::count_lines(&conn).unwrap();
        EnrichmentEngine.run(&conn, true).unwrap();
        assert_eq!(db::count_lines(&conn).unwrap(), before);
    }
}
