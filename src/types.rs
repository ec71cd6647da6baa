use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::confidence::TagDecision;

/// Batch lifecycle: Idle -> Running -> Completed | Cancelling -> Cancelled | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    Idle,
    Running,
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BatchStatus::Idle => "idle",
            BatchStatus::Running => "running",
            BatchStatus::Cancelling => "cancelling",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Failed => "failed",
        }
    }

    /// Whether a batch in this state still owns the orchestrator.
    pub fn is_active(&self) -> bool {
        matches!(self, BatchStatus::Running | BatchStatus::Cancelling)
    }
}

/// Provider selection passed through to the analyzer for every item.
///
/// Only `provider_id` and `model_id` are interpreted here (cache keys and
/// concurrency limits). Everything else rides along in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProviderSettings {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }

    /// Set the model identifier (builder pattern).
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Attach an opaque provider-specific value (builder pattern).
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// One unit of batch work. Consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub item_id: String,
    pub priority: i32,
    pub settings: Arc<ProviderSettings>,
}

/// Per-call options for [`BatchOrchestrator::execute`](crate::BatchOrchestrator::execute).
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Queue priority for every item in this batch. Higher dequeues sooner.
    pub priority: i32,
    /// Worker count. `None` resolves through configuration.
    pub concurrency: Option<usize>,
    /// Pause each worker takes between items.
    pub delay_between_items: Duration,
    /// Keep pulling work after an item fails.
    pub continue_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            concurrency: None,
            delay_between_items: Duration::ZERO,
            continue_on_error: true,
        }
    }
}

impl BatchOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_between_items = delay;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }
}

/// Point-in-time view of the running batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub status: BatchStatus,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub percentage: u8,
}

/// What the analyzer produced for a single item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Tags that cleared their threshold and should be applied.
    pub tags: Vec<String>,
    /// Tags the classifier proposed but that fell short of their threshold.
    pub skipped: Vec<TagDecision>,
    pub confidence: f64,
    pub reasoning: String,
    pub tag_confidence: BTreeMap<String, f64>,
    /// Served from the analysis cache rather than the provider.
    pub from_cache: bool,
}

/// Result of processing one item inside a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub item_id: String,
    pub success: bool,
    pub analysis: Option<AnalysisResult>,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn success(item_id: String, analysis: AnalysisResult) -> Self {
        Self {
            item_id,
            success: true,
            analysis: Some(analysis),
            error: None,
        }
    }

    pub fn failure(item_id: String, error: String) -> Self {
        Self {
            item_id,
            success: false,
            analysis: None,
            error: Some(error),
        }
    }
}

/// Aggregated result returned by a finished batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub processed_ids: Vec<String>,
    pub failed_ids: Vec<String>,
    pub results: Vec<ItemOutcome>,
    pub cancelled: bool,
}

impl BatchOutcome {
    /// Items that were never analyzed (cancelled before a worker reached them).
    pub fn unprocessed(&self) -> usize {
        self.total.saturating_sub(self.success_count + self.failure_count)
    }
}

/// Observability view of the priority queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Everything the queue is tracking: `waiting + processing`.
    pub size: usize,
    /// Items not yet dequeued.
    pub waiting: usize,
    /// Items dequeued but not yet marked complete.
    pub processing: usize,
    /// Mean enqueue-to-dequeue latency in milliseconds.
    pub avg_wait_time_ms: f64,
}
