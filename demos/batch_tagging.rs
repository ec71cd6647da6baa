use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use inbox_tagger::*;
use tracing_subscriber::EnvFilter;

/// A tiny fixed mailbox.
struct DemoMailbox;

impl MessageSource for DemoMailbox {
    async fn fetch(&self, id: MessageId) -> Result<EmailContent> {
        let (from, subject, body) = match id.0 {
            1 => ("ceo@acme.test", "Board deck", "Need the deck by 9am tomorrow."),
            2 => ("news@shop.test", "50% off", "Huge sale this weekend only!"),
            3 => ("mom@family.test", "Sunday", "Dinner at six? Bring dessert."),
            _ => return Err(TaggerError::analysis(id.to_string(), "no such message")),
        };
        Ok(EmailContent::new(body)
            .with_header("From", from)
            .with_header("Subject", subject))
    }
}

/// Keyword classifier standing in for a real AI provider.
struct KeywordClassifier;

impl ClassificationProvider for KeywordClassifier {
    async fn classify(
        &self,
        content: &EmailContent,
        settings: &ProviderSettings,
    ) -> Result<Classification> {
        // Simulate provider latency
        tokio::time::sleep(Duration::from_millis(150)).await;

        let body = content.body.to_lowercase();
        let mut tags = Vec::new();
        let mut tag_confidence = BTreeMap::new();
        if body.contains("by 9am") || body.contains("deadline") {
            tags.push("urgent".to_string());
            tag_confidence.insert("urgent".to_string(), 0.92);
        }
        if body.contains("sale") {
            tags.push("promotions".to_string());
            tag_confidence.insert("promotions".to_string(), 0.97);
        }
        if body.contains("dinner") {
            tags.push("personal".to_string());
            tag_confidence.insert("personal".to_string(), 0.64);
        }

        Ok(Classification {
            tags,
            confidence: 0.8,
            reasoning: format!("keyword match via {}", settings.provider_id),
            tag_confidence,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inbox_tagger=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dir = tempfile::tempdir()?;
    let config = Arc::new(
        TaggerConfig::builder()
            .with_cache_path(dir.path().join("analysis.db"))
            .with_global_threshold(70)
            .with_tag_override("personal", 60)
            .with_concurrency_limit("keywords", None, 2)
            .build(),
    );

    let cache = Arc::new(AnalysisCache::from_config(&config));
    let analyzer = CachingAnalyzer::new(
        DemoMailbox,
        KeywordClassifier,
        Arc::clone(&cache),
        config.clone(),
    );
    let orchestrator = BatchOrchestrator::new(analyzer, config);

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {}", serde_json::to_string(&event).unwrap_or_default());
        }
    });

    let settings = ProviderSettings::new("keywords").with_model("v1");
    let ids: Vec<String> = ["1", "2", "3", "4", "1"].iter().map(|s| s.to_string()).collect();

    let outcome = orchestrator
        .execute(ids, settings, BatchOptions::default())
        .await?;

    println!(
        "\nBatch {}: {} tagged, {} failed",
        outcome.batch_id, outcome.success_count, outcome.failure_count
    );
    for result in &outcome.results {
        match (&result.analysis, &result.error) {
            (Some(analysis), _) => println!(
                "  #{} -> {:?} (skipped {}, cached: {})",
                result.item_id,
                analysis.tags,
                analysis.skipped.len(),
                analysis.from_cache
            ),
            (None, Some(error)) => println!("  #{} failed: {}", result.item_id, error),
            (None, None) => {}
        }
    }

    let stats = cache.stats();
    println!(
        "\nCache: {} entries, {} hits, {} misses ({}% hit rate)",
        stats.total_entries, stats.hits, stats.misses, stats.hit_rate
    );

    Ok(())
}
