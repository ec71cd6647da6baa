//! # Inbox Tagger
//!
//! Concurrent, cache-backed email classification with confidence-gated tagging.
//!
//! ## Features
//!
//! - Bounded worker pool draining a priority queue (higher priority first, FIFO within a level)
//! - Single-flight batches with cooperative cancellation and partial-failure aggregation
//! - Content-addressed SQLite result cache with TTL expiry and forward schema migration
//! - Per-tag confidence thresholds with a global default
//! - Progress events over a broadcast channel
//!
//! ## Quick Start
//!
//! 1. Implement [`MessageSource`] (mail retrieval) and [`ClassificationProvider`] (AI call)
//! 2. Wrap them in a [`CachingAnalyzer`] with an [`AnalysisCache`] and a [`TaggerConfig`]
//! 3. Create a [`BatchOrchestrator`] around the analyzer
//! 4. Call [`BatchOrchestrator::execute()`] with message ids and [`ProviderSettings`]
//!
//! See `demos/batch_tagging.rs` for a complete program.

pub mod analyzer;
pub mod cache;
pub mod confidence;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod hash;
pub mod orchestrator;
pub mod queue;
pub mod types;

pub use analyzer::{
    CachingAnalyzer, Classification, ClassificationProvider, EmailContent, MessageId,
    MessageSource,
};
pub use cache::{AnalysisCache, CacheEntry, CacheStats};
pub use confidence::{ConfidenceLevel, TagDecision, ThresholdConfig};
pub use config::{ConcurrencyLimits, ConfigProvider, TaggerConfig, TaggerConfigBuilder};
pub use error::{RangeError, Result, TaggerError};
pub use events::BatchEvent;
pub use hash::{cache_key, hash_email};
pub use orchestrator::BatchOrchestrator;
pub use queue::PriorityQueue;
pub use types::{
    AnalysisResult, BatchOptions, BatchOutcome, BatchProgress, BatchStatus, ItemOutcome,
    ProviderSettings, QueueSnapshot, WorkItem,
};

/// Analyzes a single item on behalf of a batch worker.
///
/// [`CachingAnalyzer`] is the production implementation. Errors are recorded
/// as per-item failures; they never abort the batch unless the caller asked
/// for `continue_on_error = false`.
///
/// # Example
///
/// ```ignore
/// use inbox_tagger::*;
///
/// struct AlwaysWork;
///
/// impl ItemAnalyzer for AlwaysWork {
///     async fn analyze(
///         &self,
///         item_id: &str,
///         _settings: &ProviderSettings,
///     ) -> Result<AnalysisResult> {
///         Ok(AnalysisResult {
///             tags: vec!["work".into()],
///             skipped: vec![],
///             confidence: 0.9,
///             reasoning: format!("{} mentions a meeting", item_id),
///             tag_confidence: Default::default(),
///             from_cache: false,
///         })
///     }
/// }
/// ```
pub trait ItemAnalyzer: Send + Sync + 'static {
    /// Analyze one item. `item_id` is passed through exactly as submitted.
    fn analyze(
        &self,
        item_id: &str,
        settings: &ProviderSettings,
    ) -> impl std::future::Future<Output = Result<AnalysisResult>> + Send;
}
