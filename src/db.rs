use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

/// Current on-disk schema version, tracked in `PRAGMA user_version`.
///
/// - 1: key, tags, overall confidence, reasoning, created_at
/// - 2: adds per-tag confidence and a per-row schema version
pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_cache (
    key             TEXT PRIMARY KEY,
    tags_json       TEXT NOT NULL,
    confidence      REAL NOT NULL,
    reasoning       TEXT NOT NULL DEFAULT '',
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analysis_cache_created_at ON analysis_cache(created_at);
"#;

/// One persisted analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub key: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
    /// `None` only for rows written before schema version 2 and not yet migrated.
    pub tag_confidence: Option<BTreeMap<String, f64>>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub schema_version: i64,
}

/// Open (or create) the cache database and bring it to [`SCHEMA_VERSION`].
/// Pass `None` for an in-memory database.
pub fn open_database(path: Option<&std::path::Path>) -> Result<Connection> {
    let mut conn = match path {
        Some(p) => Connection::open(p).context("Failed to open cache database")?,
        None => Connection::open_in_memory().context("Failed to open in-memory database")?,
    };

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )
    .context("Failed to set PRAGMA options")?;

    migrate(&mut conn)?;
    Ok(conn)
}

pub fn schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("Failed to read schema version")
}

/// Upgrade the schema in place. Returns the number of rows backfilled.
///
/// Each step commits together with its version bump, so an interrupted run
/// leaves the store at the previous version with every row intact, and the
/// next open repeats the step. Backfill only touches rows that still lack
/// per-tag confidence, so repeating it is a no-op for migrated rows.
pub fn migrate(conn: &mut Connection) -> Result<usize> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        anyhow::bail!(
            "Cache schema version {} is newer than supported version {}",
            current,
            SCHEMA_VERSION
        );
    }

    if current < 1 {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .context("Failed to begin schema v1 migration")?;
        tx.execute_batch(SCHEMA_V1)
            .context("Failed to create cache schema")?;
        tx.execute_batch("PRAGMA user_version = 1")?;
        tx.commit().context("Failed to commit schema v1")?;
    }

    let mut backfilled = 0;
    if current < 2 {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .context("Failed to begin schema v2 migration")?;

        if !has_column(&tx, "tag_confidence_json")? {
            tx.execute_batch("ALTER TABLE analysis_cache ADD COLUMN tag_confidence_json TEXT")
                .context("Failed to add tag_confidence_json column")?;
        }
        if !has_column(&tx, "schema_version")? {
            tx.execute_batch(
                "ALTER TABLE analysis_cache ADD COLUMN schema_version INTEGER NOT NULL DEFAULT 1",
            )
            .context("Failed to add schema_version column")?;
        }

        backfilled = backfill_tag_confidence(&tx)?;
        tx.execute_batch("PRAGMA user_version = 2")?;
        tx.commit().context("Failed to commit schema v2")?;

        if current >= 1 {
            tracing::info!(
                from = current,
                to = SCHEMA_VERSION,
                backfilled,
                "Migrated analysis cache schema"
            );
        }
    }

    Ok(backfilled)
}

fn has_column(conn: &Connection, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info('analysis_cache')")
        .context("Failed to inspect cache table")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .context("Failed to list cache columns")?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fill per-tag confidence from the overall confidence wherever it is missing.
fn backfill_tag_confidence(conn: &Connection) -> Result<usize> {
    let pending: Vec<(String, String, f64)> = {
        let mut stmt = conn
            .prepare(
                "SELECT key, tags_json, confidence FROM analysis_cache
                 WHERE tag_confidence_json IS NULL",
            )
            .context("Failed to prepare backfill query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .context("Failed to query rows for backfill")?;
        rows.collect::<rusqlite::Result<_>>()
            .context("Failed to read backfill row")?
    };

    for (key, tags_json, confidence) in &pending {
        let tags: Vec<String> = serde_json::from_str(tags_json).unwrap_or_else(|e| {
            tracing::warn!(key = %key, error = %e, "Unreadable tags during backfill");
            Vec::new()
        });
        let filled = fill_tag_confidence(&tags, *confidence, None);
        conn.execute(
            "UPDATE analysis_cache SET tag_confidence_json = ?1, schema_version = ?2
             WHERE key = ?3 AND tag_confidence_json IS NULL",
            params![serde_json::to_string(&filled)?, SCHEMA_VERSION, key],
        )
        .context("Failed to backfill tag confidence")?;
    }

    Ok(pending.len())
}

/// Complete a per-tag confidence map: every tag in `tags` gets an entry,
/// taken from `supplied` when present and `overall` otherwise. Entries in
/// `supplied` for tags not in `tags` are kept.
pub fn fill_tag_confidence(
    tags: &[String],
    overall: f64,
    supplied: Option<&BTreeMap<String, f64>>,
) -> BTreeMap<String, f64> {
    let mut filled = supplied.cloned().unwrap_or_default();
    for tag in tags {
        filled.entry(tag.clone()).or_insert(overall);
    }
    filled
}

/// Insert or replace an entry.
pub fn upsert_entry(conn: &Connection, row: &CacheRow) -> Result<()> {
    let tag_confidence = row
        .tag_confidence
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO analysis_cache
            (key, tags_json, confidence, reasoning, tag_confidence_json, created_at, schema_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.key,
            serde_json::to_string(&row.tags)?,
            row.confidence,
            row.reasoning,
            tag_confidence,
            row.created_at,
            row.schema_version,
        ],
    )
    .context("Failed to write cache entry")?;
    Ok(())
}

/// Fetch an entry by key regardless of age.
pub fn get_entry(conn: &Connection, key: &str) -> Result<Option<CacheRow>> {
    let raw = conn
        .query_row(
            "SELECT key, tags_json, confidence, reasoning, tag_confidence_json,
                    created_at, schema_version
             FROM analysis_cache WHERE key = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()
        .context("Failed to query cache entry")?;

    let Some((key, tags_json, confidence, reasoning, tc_json, created_at, schema_version)) = raw
    else {
        return Ok(None);
    };

    let tags: Vec<String> =
        serde_json::from_str(&tags_json).context("Failed to parse cached tags")?;
    let tag_confidence: Option<BTreeMap<String, f64>> = tc_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .context("Failed to parse cached tag confidence")?;

    Ok(Some(CacheRow {
        key,
        tags,
        confidence,
        reasoning,
        tag_confidence,
        created_at,
        schema_version,
    }))
}

/// Check for a key without decoding the row. Returns its `created_at`.
pub fn entry_created_at(conn: &Connection, key: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT created_at FROM analysis_cache WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .context("Failed to check cache entry")
}

/// Delete one entry. Returns whether it existed.
pub fn delete_entry(conn: &Connection, key: &str) -> Result<bool> {
    let count = conn
        .execute("DELETE FROM analysis_cache WHERE key = ?1", params![key])
        .context("Failed to delete cache entry")?;
    Ok(count > 0)
}

/// Delete one entry only if it is still the version written at `created_at`.
/// Returns whether it was deleted.
pub fn delete_entry_created_at(conn: &Connection, key: &str, created_at: i64) -> Result<bool> {
    let count = conn
        .execute(
            "DELETE FROM analysis_cache WHERE key = ?1 AND created_at = ?2",
            params![key, created_at],
        )
        .context("Failed to delete expired cache entry")?;
    Ok(count > 0)
}

/// Delete every entry. Returns the number deleted.
pub fn clear_entries(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM analysis_cache", [])
        .context("Failed to clear cache")
}

/// Delete entries created strictly before `cutoff_ms`, oldest first.
/// Returns the number deleted.
pub fn delete_created_before(conn: &Connection, cutoff_ms: i64) -> Result<usize> {
    let expired: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT key FROM analysis_cache
                 WHERE created_at < ?1
                 ORDER BY created_at ASC",
            )
            .context("Failed to prepare expiry sweep")?;
        let rows = stmt
            .query_map(params![cutoff_ms], |row| row.get(0))
            .context("Failed to query expired entries")?;
        rows.collect::<rusqlite::Result<_>>()
            .context("Failed to read expired key")?
    };

    let mut removed = 0;
    for key in &expired {
        // Re-check the age so an entry rewritten mid-sweep survives.
        removed += conn
            .execute(
                "DELETE FROM analysis_cache WHERE key = ?1 AND created_at < ?2",
                params![key, cutoff_ms],
            )
            .context("Failed to delete expired entry")?;
    }
    Ok(removed)
}

pub fn count_entries(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM analysis_cache", [], |row| row.get(0))
        .context("Failed to count cache entries")?;
    Ok(count as usize)
}
