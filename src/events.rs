use serde::{Deserialize, Serialize};

use crate::types::BatchStatus;

/// Progress messages broadcast while a batch runs.
///
/// Subscribe with [`BatchOrchestrator::subscribe`](crate::BatchOrchestrator::subscribe).
/// Serializes as `{"type": "itemCompleted", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BatchEvent {
    /// Emitted once the batch is queued and workers are starting.
    Started {
        batch_id: String,
        total: usize,
        concurrency: usize,
    },
    /// Emitted when an item is analyzed successfully.
    ItemCompleted {
        batch_id: String,
        item_id: String,
        tags: Vec<String>,
        processed: usize,
        failed: usize,
        total: usize,
    },
    /// Emitted when an item fails.
    ItemFailed {
        batch_id: String,
        item_id: String,
        error: String,
        processed: usize,
        failed: usize,
        total: usize,
    },
    /// Emitted when cancellation is requested; `cleared` items were never started.
    CancelRequested { batch_id: String, cleared: usize },
    /// Emitted after every worker has exited.
    Finished {
        batch_id: String,
        status: BatchStatus,
        success_count: usize,
        failure_count: usize,
        total: usize,
    },
}

impl BatchEvent {
    pub fn batch_id(&self) -> &str {
        match self {
            BatchEvent::Started { batch_id, .. }
            | BatchEvent::ItemCompleted { batch_id, .. }
            | BatchEvent::ItemFailed { batch_id, .. }
            | BatchEvent::CancelRequested { batch_id, .. }
            | BatchEvent::Finished { batch_id, .. } => batch_id,
        }
    }
}
