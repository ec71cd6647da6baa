
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use inbox_tagger::*;
use tempfile::tempdir;
use test_helpers::*;

fn orchestrator(analyzer: ScriptedAnalyzer) -> BatchOrchestrator<ScriptedAnalyzer> {
    BatchOrchestrator::new(analyzer, Arc::new(TaggerConfig::default()))
}

fn settings() -> ProviderSettings {
    ProviderSettings::new("openai").with_model("gpt-4o-mini")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// -- Aggregation --

#[tokio::test]
async fn test_all_items_succeed() {
    let orch = orchestrator(ScriptedAnalyzer::new());
    let outcome = orch
        .execute(ids(0..5), settings(), BatchOptions::default().with_concurrency(2))
        .await
        .unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.total, 5);
    assert_eq!(outcome.success_count, 5);
    assert_eq!(outcome.failure_count, 0);
    assert_eq!(outcome.results.len(), 5);
    assert!(outcome.results.iter().all(|r| r.success && r.analysis.is_some()));
    assert!(!outcome.cancelled);
    assert!(!outcome.batch_id.is_empty());
}

#[tokio::test]
async fn test_partial_failure_is_aggregated() {
    let orch = orchestrator(ScriptedAnalyzer::new().failing("1").failing("3"));
    let outcome = orch
        .execute(ids(0..5), settings(), BatchOptions::default().with_concurrency(1))
        .await
        .unwrap();

    assert_eq!(outcome.success_count, 3);
    assert_eq!(outcome.failure_count, 2);
    assert_eq!(outcome.processed_ids, vec!["0", "2", "4"]);
    assert_eq!(outcome.failed_ids, vec!["1", "3"]);

    let failed = outcome.results.iter().find(|r| r.item_id == "1").unwrap();
    assert!(!failed.success);
    assert!(failed
        .error
        .as_deref()
        .unwrap()
        .contains("provider rejected request"));
    assert!(!outcome.cancelled);
}

#[tokio::test]
async fn test_every_item_counted_once() {
    let orch = orchestrator(ScriptedAnalyzer::new().failing("7"));
    let outcome = orch
        .execute(ids(0..40), settings(), BatchOptions::default().with_concurrency(4))
        .await
        .unwrap();

    assert_eq!(outcome.success_count + outcome.failure_count, 40);
    let mut calls = orch.analyzer().calls();
    calls.sort();
    calls.dedup();
    assert_eq!(calls.len(), 40);
}

#[tokio::test]
async fn test_empty_batch_completes() {
    let orch = orchestrator(ScriptedAnalyzer::new());
    let outcome = orch
        .execute(Vec::new(), settings(), BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.total, 0);
    assert_eq!(outcome.unprocessed(), 0);
    assert!(orch.analyzer().calls().is_empty());
}

// -- Concurrency --

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let orch = orchestrator(ScriptedAnalyzer::new().with_delay(Duration::from_millis(20)));
    let outcome = orch
        .execute(ids(0..9), settings(), BatchOptions::default().with_concurrency(3))
        .await
        .unwrap();

    assert_eq!(outcome.success_count, 9);
    assert_eq!(orch.analyzer().peak(), 3);
}

#[tokio::test]
async fn test_concurrency_from_config() {
    let config = TaggerConfig::builder()
        .with_concurrency_limit("ollama", None, 2)
        .build();
    let orch = BatchOrchestrator::new(
        ScriptedAnalyzer::new().with_delay(Duration::from_millis(10)),
        Arc::new(config),
    );
    let mut events = orch.subscribe();

    orch.execute(
        ids(0..6),
        ProviderSettings::new("ollama").with_model("llava"),
        BatchOptions::default(),
    )
    .await
    .unwrap();

    assert!(orch.analyzer().peak() <= 2);
    match events.try_recv().unwrap() {
        BatchEvent::Started { concurrency, total, .. } => {
            assert_eq!(concurrency, 2);
            assert_eq!(total, 6);
        }
        other => panic!("expected Started, got {:?}", other),
    }
}

// -- Single flight --

#[tokio::test]
async fn test_second_execute_is_rejected() {
    let orch = Arc::new(orchestrator(
        ScriptedAnalyzer::new().with_delay(Duration::from_millis(20)),
    ));

    let running = Arc::clone(&orch);
    let first = tokio::spawn(async move {
        running
            .execute(ids(0..5), settings(), BatchOptions::default().with_concurrency(1))
            .await
    });

    wait_until(|| orch.is_running()).await;
    let second = orch
        .execute(ids(10..12), settings(), BatchOptions::default())
        .await;
    assert!(matches!(second, Err(TaggerError::AlreadyRunning)));

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.success_count, 5);
    assert!(!orch.analyzer().calls().contains(&"10".to_string()));

    // Reusable once idle again.
    let third = orch
        .execute(ids(20..22), settings(), BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(third.success_count, 2);
    assert_ne!(third.batch_id, outcome.batch_id);
}

// -- Cancellation --

#[tokio::test]
async fn test_cancel_when_idle_is_noop() {
    let orch = orchestrator(ScriptedAnalyzer::new());
    assert!(!orch.cancel());
    assert_eq!(orch.progress().status, BatchStatus::Idle);
}

#[tokio::test]
async fn test_cancel_drops_unstarted_items() {
    let orch = Arc::new(orchestrator(
        ScriptedAnalyzer::new().with_delay(Duration::from_millis(30)),
    ));
    let mut events = orch.subscribe();

    let running = Arc::clone(&orch);
    let batch = tokio::spawn(async move {
        running
            .execute(ids(0..10), settings(), BatchOptions::default().with_concurrency(2))
            .await
    });

    wait_until(|| orch.progress().processed >= 2).await;
    assert!(orch.cancel());
    assert!(!orch.cancel());
    assert_eq!(orch.progress().status, BatchStatus::Cancelling);

    // Still owns the orchestrator until in-flight items finish.
    let during = orch.execute(ids(0..1), settings(), BatchOptions::default()).await;
    assert!(matches!(during, Err(TaggerError::AlreadyRunning)));

    let outcome = batch.await.unwrap().unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.status, BatchStatus::Cancelled);
    assert!(outcome.success_count >= 2);
    assert!(outcome.unprocessed() > 0);
    assert_eq!(
        outcome.results.len(),
        outcome.success_count + outcome.failure_count
    );

    assert_eq!(orch.progress().status, BatchStatus::Idle);
    assert_eq!(orch.queue_stats().size, 0);

    let mut saw_cancel = false;
    while let Ok(event) = events.try_recv() {
        if let BatchEvent::CancelRequested { cleared, .. } = event {
            saw_cancel = true;
            assert!(cleared > 0);
        }
    }
    assert!(saw_cancel);
}

#[tokio::test]
async fn test_cancel_after_two_dequeued() {
    let orch = Arc::new(orchestrator(
        ScriptedAnalyzer::new().with_delay(Duration::from_millis(30)),
    ));

    let running = Arc::clone(&orch);
    let batch = tokio::spawn(async move {
        running
            .execute(ids(0..5), settings(), BatchOptions::default().with_concurrency(1))
            .await
    });

    // Item "1" is in flight once the analyzer has seen two ids.
    wait_until(|| orch.analyzer().calls().len() == 2).await;
    assert!(orch.cancel());

    let outcome = batch.await.unwrap().unwrap();
    let analyzed = orch.analyzer().calls();
    assert_eq!(analyzed, vec!["0", "1"]);
    assert_eq!(outcome.processed_ids, vec!["0", "1"]);
    assert!(outcome.cancelled);
    assert_eq!(
        outcome.total - analyzed.len(),
        outcome.total - outcome.success_count - outcome.failure_count
    );
    assert_eq!(outcome.unprocessed(), 3);
}

#[tokio::test]
async fn test_abandoned_batch_leaves_next_batch_intact() {
    let orch = Arc::new(orchestrator(
        ScriptedAnalyzer::new().with_delay(Duration::from_millis(40)),
    ));

    let running = Arc::clone(&orch);
    let abandoned = tokio::spawn(async move {
        running
            .execute(ids(0..5), settings(), BatchOptions::default().with_concurrency(1))
            .await
    });
    wait_until(|| orch.analyzer().calls().len() == 1).await;

    // Dropping the execute() future releases the orchestrator mid-item.
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());
    assert_eq!(orch.progress().status, BatchStatus::Idle);

    let outcome = orch
        .execute(ids(100..103), settings(), BatchOptions::default().with_concurrency(1))
        .await
        .unwrap();

    assert_eq!(outcome.processed_ids, vec!["100", "101", "102"]);
    assert_eq!(outcome.results.len(), 3);
    assert_eq!(outcome.status, BatchStatus::Completed);

    // The stale worker finished "0" and took nothing else.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let calls = orch.analyzer().calls();
    assert_eq!(calls.iter().filter(|c| c.as_str() == "1").count(), 0);
    assert_eq!(calls.iter().filter(|c| c.as_str() == "101").count(), 1);
}

#[tokio::test]
async fn test_stop_on_first_error() {
    let orch = orchestrator(ScriptedAnalyzer::new().failing("2"));
    let outcome = orch
        .execute(
            ids(0..5),
            settings(),
            BatchOptions::default()
                .with_concurrency(1)
                .with_continue_on_error(false),
        )
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.processed_ids, vec!["0", "1"]);
    assert_eq!(outcome.failed_ids, vec!["2"]);
    assert_eq!(outcome.unprocessed(), 2);
    assert_eq!(orch.analyzer().calls(), vec!["0", "1", "2"]);
}

// -- Worker faults --

#[tokio::test]
async fn test_panicking_item_is_recorded() {
    let orch = orchestrator(ScriptedAnalyzer::new().panicking("2"));
    let outcome = orch
        .execute(ids(0..6), settings(), BatchOptions::default().with_concurrency(2))
        .await
        .unwrap();

    assert_eq!(outcome.failed_ids, vec!["2"]);
    assert_eq!(outcome.success_count, 5);
    assert!(!outcome.cancelled);

    let failed = outcome.results.iter().find(|r| !r.success).unwrap();
    let error = failed.error.as_deref().unwrap();
    assert!(error.contains("Worker failed"));
    assert!(error.contains("analyzer exploded on 2"));
    assert!(!orch.is_running());
}

#[tokio::test]
async fn test_panic_cancels_when_not_continuing() {
    let orch = orchestrator(ScriptedAnalyzer::new().panicking("1"));
    let outcome = orch
        .execute(
            ids(0..6),
            settings(),
            BatchOptions::default()
                .with_concurrency(1)
                .with_continue_on_error(false),
        )
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.status, BatchStatus::Failed);
    assert_eq!(outcome.processed_ids, vec!["0"]);
    assert_eq!(outcome.failed_ids, vec!["1"]);
    assert_eq!(outcome.unprocessed(), 4);
    assert_eq!(orch.analyzer().calls(), vec!["0", "1"]);
}

#[tokio::test]
async fn test_single_worker_survives_panic() {
    let orch = orchestrator(ScriptedAnalyzer::new().panicking("1"));
    let outcome = orch
        .execute(ids(0..5), settings(), BatchOptions::default().with_concurrency(1))
        .await
        .unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert!(!outcome.cancelled);
    assert_eq!(outcome.processed_ids, vec!["0", "2", "3", "4"]);
    assert_eq!(outcome.failed_ids, vec!["1"]);
    assert_eq!(outcome.unprocessed(), 0);
    assert_eq!(orch.analyzer().calls(), vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn test_every_panic_still_drains_queue() {
    let mut analyzer = ScriptedAnalyzer::new();
    for id in ids(0..4) {
        analyzer = analyzer.panicking(&id);
    }
    let orch = orchestrator(analyzer);
    let outcome = orch
        .execute(ids(0..4), settings(), BatchOptions::default().with_concurrency(2))
        .await
        .unwrap();

    assert_eq!(outcome.failure_count, 4);
    assert_eq!(outcome.unprocessed(), 0);
    assert_eq!(outcome.status, BatchStatus::Completed);
}

// -- Progress & events --

#[tokio::test]
async fn test_progress_while_running() {
    let orch = Arc::new(orchestrator(
        ScriptedAnalyzer::new().with_delay(Duration::from_millis(25)),
    ));

    let running = Arc::clone(&orch);
    let batch = tokio::spawn(async move {
        running
            .execute(ids(0..4), settings(), BatchOptions::default().with_concurrency(1))
            .await
    });

    wait_until(|| orch.progress().processed >= 1).await;
    let progress = orch.progress();
    assert_eq!(progress.total, 4);
    let done = progress.processed + progress.failed;
    assert_eq!(progress.percentage as usize, done * 100 / 4);

    batch.await.unwrap().unwrap();
    let idle = orch.progress();
    assert_eq!(idle.status, BatchStatus::Idle);
    assert_eq!(idle.total, 0);
}

#[tokio::test]
async fn test_counts_balance_while_running() {
    let orch = Arc::new(orchestrator(
        ScriptedAnalyzer::new()
            .with_delay(Duration::from_millis(10))
            .failing("3"),
    ));

    let running = Arc::clone(&orch);
    let batch = tokio::spawn(async move {
        running
            .execute(ids(0..8), settings(), BatchOptions::default().with_concurrency(2))
            .await
    });

    let mut samples = 0;
    while !batch.is_finished() {
        let progress = orch.progress();
        let queue = orch.queue_stats();
        if progress.status == BatchStatus::Running {
            // Remaining work is everything waiting plus what workers hold.
            assert_eq!(
                progress.total,
                progress.processed + progress.failed + queue.waiting + queue.processing
            );
            assert!(queue.processing <= 2);
            samples += 1;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let outcome = batch.await.unwrap().unwrap();
    assert!(samples > 0);
    assert_eq!(outcome.success_count + outcome.failure_count, outcome.total);
}

#[tokio::test]
async fn test_event_stream() {
    let orch = orchestrator(ScriptedAnalyzer::new().failing("1"));
    let mut events = orch.subscribe();

    let outcome = orch
        .execute(ids(0..3), settings(), BatchOptions::default().with_concurrency(1))
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.batch_id(), outcome.batch_id);
        received.push(event);
    }

    assert!(matches!(received.first(), Some(BatchEvent::Started { total: 3, .. })));
    assert!(matches!(
        received.last(),
        Some(BatchEvent::Finished {
            status: BatchStatus::Completed,
            success_count: 2,
            failure_count: 1,
            ..
        })
    ));

    let completed = received
        .iter()
        .filter(|e| matches!(e, BatchEvent::ItemCompleted { .. }))
        .count();
    let failed: Vec<_> = received
        .iter()
        .filter_map(|e| match e {
            BatchEvent::ItemFailed { item_id, failed, .. } => Some((item_id.clone(), *failed)),
            _ => None,
        })
        .collect();
    assert_eq!(completed, 2);
    assert_eq!(failed, vec![("1".to_string(), 1)]);
}

#[tokio::test]
async fn test_delay_between_items() {
    let orch = orchestrator(ScriptedAnalyzer::new());
    let started = std::time::Instant::now();
    orch.execute(
        ids(0..3),
        settings(),
        BatchOptions::default()
            .with_concurrency(1)
            .with_delay(Duration::from_millis(20)),
    )
    .await
    .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(60));
}

// -- End to end with the caching analyzer --

fn caching(
    cache: Arc<AnalysisCache>,
    provider: FixedProvider,
    config: TaggerConfig,
) -> BatchOrchestrator<CachingAnalyzer<MemorySource, FixedProvider>> {
    let config: Arc<TaggerConfig> = Arc::new(config);
    let analyzer = CachingAnalyzer::new(inbox(), provider, cache, config.clone());
    BatchOrchestrator::new(analyzer, config)
}

#[tokio::test]
async fn test_caching_analyzer_applies_thresholds() {
    let provider = FixedProvider::new(work_urgent());
    let orch = caching(
        Arc::new(AnalysisCache::in_memory()),
        provider,
        TaggerConfig::default(),
    );

    let outcome = orch
        .execute(vec!["1".to_string()], settings(), BatchOptions::default())
        .await
        .unwrap();

    let analysis = outcome.results[0].analysis.as_ref().unwrap();
    assert_eq!(analysis.tags, vec!["work"]);
    assert_eq!(analysis.skipped.len(), 1);
    assert_eq!(analysis.skipped[0].tag, "urgent");
    assert_eq!(analysis.skipped[0].threshold, 70);
    assert_eq!(analysis.tag_confidence["work"], 0.8);
    assert_eq!(analysis.tag_confidence["urgent"], 0.5);
    assert!(!analysis.from_cache);
}

#[tokio::test]
async fn test_tag_override_lowers_bar() {
    let config = TaggerConfig::builder().with_tag_override("urgent", 40).build();
    let orch = caching(
        Arc::new(AnalysisCache::in_memory()),
        FixedProvider::new(work_urgent()),
        config,
    );

    let outcome = orch
        .execute(vec!["1".to_string()], settings(), BatchOptions::default())
        .await
        .unwrap();

    let analysis = outcome.results[0].analysis.as_ref().unwrap();
    assert_eq!(analysis.tags, vec!["work", "urgent"]);
    assert!(analysis.skipped.is_empty());
}

#[tokio::test]
async fn test_duplicate_message_served_from_cache() {
    let provider = FixedProvider::new(work_urgent());
    let calls = provider.counter();
    let cache = Arc::new(AnalysisCache::in_memory());
    let orch = caching(Arc::clone(&cache), provider, TaggerConfig::default());

    let outcome = orch
        .execute(
            vec!["1".to_string(), "2".to_string(), "1".to_string()],
            settings(),
            BatchOptions::default().with_concurrency(1),
        )
        .await
        .unwrap();

    assert_eq!(outcome.success_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let last = outcome.results[2].analysis.as_ref().unwrap();
    assert!(last.from_cache);
    assert_eq!(last.tags, vec!["work"]);

    let stats = cache.stats();
    assert_eq!(stats.total_entries, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[tokio::test]
async fn test_model_change_misses_cache() {
    let provider = FixedProvider::new(work_urgent());
    let calls = provider.counter();
    let orch = caching(
        Arc::new(AnalysisCache::in_memory()),
        provider,
        TaggerConfig::default(),
    );

    for model in ["gpt-4o-mini", "gpt-4o"] {
        orch.execute(
            vec!["1".to_string()],
            ProviderSettings::new("openai").with_model(model),
            BatchOptions::default(),
        )
        .await
        .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_bad_identifiers_and_missing_messages_fail_per_item() {
    let orch = caching(
        Arc::new(AnalysisCache::in_memory()),
        FixedProvider::new(work_urgent()),
        TaggerConfig::default(),
    );

    let outcome = orch
        .execute(
            vec!["abc".to_string(), "99".to_string(), "2".to_string()],
            settings(),
            BatchOptions::default().with_concurrency(1),
        )
        .await
        .unwrap();

    assert_eq!(outcome.processed_ids, vec!["2"]);
    assert_eq!(outcome.failed_ids, vec!["abc", "99"]);
    assert!(outcome.results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Invalid item identifier"));
    assert!(outcome.results[1]
        .error
        .as_deref()
        .unwrap()
        .contains("message not found"));
}

#[tokio::test]
async fn test_out_of_range_confidence_is_not_cached() {
    let mut answer = work_urgent();
    answer.confidence = 1.5;
    let cache = Arc::new(AnalysisCache::in_memory());
    let orch = caching(
        Arc::clone(&cache),
        FixedProvider::new(answer),
        TaggerConfig::default(),
    );

    let outcome = orch
        .execute(vec!["1".to_string()], settings(), BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.failure_count, 1);
    assert!(outcome.results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("out of range"));
    assert_eq!(cache.stats().total_entries, 0);
}

#[tokio::test]
async fn test_cache_survives_reopen() {
    let temp = tempdir().unwrap();
    let config = TaggerConfig::builder()
        .with_cache_path(temp.path().join("analysis.db"))
        .build();

    {
        let provider = FixedProvider::new(work_urgent());
        let calls = provider.counter();
        let cache = Arc::new(AnalysisCache::from_config(&config));
        assert!(cache.is_available());
        let orch = caching(cache, provider, config.clone());
        orch.execute(vec!["1".to_string()], settings(), BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    let provider = FixedProvider::new(work_urgent());
    let calls = provider.counter();
    let cache = Arc::new(AnalysisCache::from_config(&config));
    assert_eq!(cache.schema_version(), Some(2));
    let orch = caching(Arc::clone(&cache), provider, config);

    let outcome = orch
        .execute(vec!["1".to_string()], settings(), BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(outcome.results[0].analysis.as_ref().unwrap().from_cache);
}

#[tokio::test]
async fn test_expired_entry_is_reclassified() {
    let provider = FixedProvider::new(work_urgent());
    let calls = provider.counter();
    let cache = Arc::new(AnalysisCache::open(None, Duration::from_millis(30)));
    let orch = caching(Arc::clone(&cache), provider, TaggerConfig::default());

    orch.execute(vec!["1".to_string()], settings(), BatchOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let outcome = orch
        .execute(vec!["1".to_string()], settings(), BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!outcome.results[0].analysis.as_ref().unwrap().from_cache);
}
