use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;

use crate::config::TaggerConfig;
use crate::confidence::validate_confidence;
use crate::db::{self, CacheRow};
use crate::error::{Result, TaggerError};

/// Default time-to-live for cached analyses.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A cached classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub tags: Vec<String>,
    pub overall_confidence: f64,
    pub reasoning: String,
    /// Always has an entry for every tag in `tags`.
    pub tag_confidence: BTreeMap<String, f64>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub schema_version: i64,
}

impl From<CacheRow> for CacheEntry {
    fn from(row: CacheRow) -> Self {
        let tag_confidence =
            db::fill_tag_confidence(&row.tags, row.confidence, row.tag_confidence.as_ref());
        Self {
            key: row.key,
            tags: row.tags,
            overall_confidence: row.confidence,
            reasoning: row.reasoning,
            tag_confidence,
            created_at: row.created_at,
            schema_version: row.schema_version,
        }
    }
}

/// Cache statistics. Hit/miss counts are per process and reset by `clear()`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups that hit, rounded to two decimals.
    pub hit_rate: f64,
}

/// Persistent, content-addressed store of classification results.
///
/// Backed by SQLite. Construct one per store and share it (`Arc`) with
/// whatever needs it. Storage failures never escape: reads degrade to misses
/// and writes to no-ops, each logged at `warn`. A cache that could not be
/// opened at all behaves as permanently empty.
pub struct AnalysisCache {
    conn: Option<Mutex<Connection>>,
    ttl_ms: i64,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl AnalysisCache {
    /// Open the store, failing if it cannot be opened or migrated.
    ///
    /// Migration completes before this returns, with exclusive access to the
    /// database.
    pub fn try_open(path: Option<&Path>, ttl: Duration) -> Result<Self> {
        let conn = db::open_database(path)
            .map_err(|e| TaggerError::Database(format!("{:#}", e)))?;
        Ok(Self::with_connection(Some(conn), ttl))
    }

    /// Open the store, falling back to a disabled cache on failure.
    pub fn open(path: Option<&Path>, ttl: Duration) -> Self {
        match Self::try_open(path, ttl) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(error = %e, "Analysis cache unavailable; continuing without it");
                Self::with_connection(None, ttl)
            }
        }
    }

    /// In-memory store with the default TTL.
    pub fn in_memory() -> Self {
        Self::open(None, DEFAULT_TTL)
    }

    pub fn from_config(config: &TaggerConfig) -> Self {
        Self::open(config.cache_path.as_deref(), config.cache_ttl())
    }

    fn with_connection(conn: Option<Connection>, ttl: Duration) -> Self {
        Self {
            conn: conn.map(Mutex::new),
            ttl_ms: ttl.as_millis().min(i64::MAX as u128) as i64,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether a backing store is attached.
    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms as u64)
    }

    /// Run `op` against the connection, logging and swallowing any failure.
    fn with_conn<T>(
        &self,
        action: &str,
        op: impl FnOnce(&Connection) -> anyhow::Result<T>,
    ) -> Option<T> {
        let conn = self.conn.as_ref()?;
        let guard = match conn.lock() {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(action, error = %e, "Cache mutex poisoned");
                return None;
            }
        };
        match op(&guard) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(action, error = %format!("{:#}", e), "Cache operation failed");
                None
            }
        }
    }

    fn is_expired(&self, created_at: i64, now: i64) -> bool {
        now.saturating_sub(created_at) > self.ttl_ms
    }

    /// Look up a key. Expired entries count as misses and are removed.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_at(key, now_ms())
    }

    /// [`get`](Self::get) evaluated at an explicit time (epoch ms).
    pub fn get_at(&self, key: &str, now: i64) -> Option<CacheEntry> {
        // Read and expiry delete run under one lock; the delete also matches
        // `created_at` so a row rewritten by another process survives.
        let live = self
            .with_conn("get", |conn| {
                let Some(row) = db::get_entry(conn, key)? else {
                    return Ok(None);
                };
                if self.is_expired(row.created_at, now) {
                    tracing::debug!(key = %key, "Cache entry expired");
                    db::delete_entry_created_at(conn, key, row.created_at)?;
                    return Ok(None);
                }
                Ok(Some(row))
            })
            .flatten();

        match live {
            Some(row) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(row.into())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result, replacing any entry under `key`.
    ///
    /// Tags are de-duplicated in order. Any tag without a score in
    /// `tag_confidence` is given `overall_confidence`. Out-of-range scores
    /// reject the write (logged); nothing is clamped.
    pub fn set(
        &self,
        key: &str,
        tags: &[String],
        overall_confidence: f64,
        reasoning: &str,
        tag_confidence: Option<&BTreeMap<String, f64>>,
    ) {
        self.set_at(key, tags, overall_confidence, reasoning, tag_confidence, now_ms())
    }

    /// [`set`](Self::set) with an explicit `created_at` (epoch ms).
    pub fn set_at(
        &self,
        key: &str,
        tags: &[String],
        overall_confidence: f64,
        reasoning: &str,
        tag_confidence: Option<&BTreeMap<String, f64>>,
        now: i64,
    ) {
        let supplied = tag_confidence.into_iter().flat_map(|m| m.values().copied());
        for value in std::iter::once(overall_confidence).chain(supplied) {
            let check = validate_confidence(value);
            if !check.valid {
                tracing::warn!(
                    key = %key,
                    reason = check.message.as_deref().unwrap_or_default(),
                    "Refusing to cache result with invalid confidence"
                );
                return;
            }
        }

        let mut seen = HashSet::new();
        let tags: Vec<String> = tags
            .iter()
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect();

        let row = CacheRow {
            key: key.to_string(),
            tag_confidence: Some(db::fill_tag_confidence(
                &tags,
                overall_confidence,
                tag_confidence,
            )),
            tags,
            confidence: overall_confidence,
            reasoning: reasoning.to_string(),
            created_at: now,
            schema_version: db::SCHEMA_VERSION,
        };

        if self
            .with_conn("set", |conn| db::upsert_entry(conn, &row))
            .is_some()
        {
            tracing::debug!(key = %key, "Cached analysis");
        }
    }

    /// Remove one entry. Missing keys are ignored.
    pub fn delete(&self, key: &str) {
        self.with_conn("delete", |conn| db::delete_entry(conn, key));
    }

    /// Remove every entry and reset hit/miss counters.
    pub fn clear(&self) {
        self.with_conn("clear", db::clear_entries);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Delete every entry older than the TTL. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(now_ms())
    }

    pub fn cleanup_expired_at(&self, now: i64) -> usize {
        let cutoff = now.saturating_sub(self.ttl_ms);
        let removed = self
            .with_conn("cleanup", |conn| db::delete_created_before(conn, cutoff))
            .unwrap_or(0);
        if removed > 0 {
            tracing::info!(removed, "Removed expired cache entries");
        }
        removed
    }

    /// Whether a live (unexpired) entry exists. Does not touch hit/miss stats.
    pub fn has(&self, key: &str) -> bool {
        self.has_at(key, now_ms())
    }

    pub fn has_at(&self, key: &str, now: i64) -> bool {
        self.with_conn("has", |conn| db::entry_created_at(conn, key))
            .flatten()
            .is_some_and(|created_at| !self.is_expired(created_at, now))
    }

    /// Per-tag confidence for a live entry. Does not touch hit/miss stats.
    pub fn tag_confidence(&self, key: &str) -> Option<BTreeMap<String, f64>> {
        self.tag_confidence_at(key, now_ms())
    }

    pub fn tag_confidence_at(&self, key: &str, now: i64) -> Option<BTreeMap<String, f64>> {
        let row = self.with_conn("tag confidence", |conn| db::get_entry(conn, key))??;
        if self.is_expired(row.created_at, now) {
            return None;
        }
        Some(CacheEntry::from(row).tag_confidence)
    }

    /// Entry count from the store plus this process's hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
        };
        CacheStats {
            total_entries: self.with_conn("count", db::count_entries).unwrap_or(0),
            hits,
            misses,
            hit_rate,
        }
    }

    /// On-disk schema version, or `None` if the store is unavailable.
    pub fn schema_version(&self) -> Option<i64> {
        self.with_conn("schema version", db::schema_version)
    }
}
