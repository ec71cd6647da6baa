//! Single-message analysis with caching and confidence gating.
//!
//! [`CachingAnalyzer`] is the [`ItemAnalyzer`] the batch orchestrator normally
//! drives. For each message it:
//!
//! 1. parses the item id into a [`MessageId`]
//! 2. fetches content through a [`MessageSource`]
//! 3. derives the content-addressed cache key
//! 4. serves a cached classification, or asks the [`ClassificationProvider`]
//!    and writes the answer back
//! 5. decides per tag whether the confidence clears its threshold
//!
//! Mail retrieval and the provider call itself live behind the two traits.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::AnalysisCache;
use crate::confidence::{resolve_tags, validate_confidence, ThresholdConfig};
use crate::config::ConfigProvider;
use crate::error::{RangeError, Result, TaggerError};
use crate::hash;
use crate::types::{AnalysisResult, ProviderSettings};
use crate::ItemAnalyzer;

/// Numeric identifier of a message in the mail store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl FromStr for MessageId {
    type Err = TaggerError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(MessageId)
            .map_err(|_| TaggerError::InvalidIdentifier(s.to_string()))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extracted message content handed to the classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailContent {
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl EmailContent {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Add a header (builder pattern).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Content-addressed cache key for this message under a provider/model.
    pub fn cache_key(&self, settings: &ProviderSettings) -> String {
        hash::cache_key(
            &self.body,
            &self.headers,
            &settings.provider_id,
            settings.model_id.as_deref(),
        )
    }
}

/// What a provider returns for one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub tags: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
    /// Optional per-tag scores. Missing tags inherit `confidence`.
    #[serde(default)]
    pub tag_confidence: BTreeMap<String, f64>,
}

/// Fetches message content from the mail store.
pub trait MessageSource: Send + Sync {
    fn fetch(&self, id: MessageId) -> impl Future<Output = Result<EmailContent>> + Send;
}

/// Calls an AI provider to classify a message.
pub trait ClassificationProvider: Send + Sync {
    fn classify(
        &self,
        content: &EmailContent,
        settings: &ProviderSettings,
    ) -> impl Future<Output = Result<Classification>> + Send;
}

/// The cache-backed single-item analyzer.
pub struct CachingAnalyzer<S, P> {
    source: S,
    provider: P,
    cache: Arc<AnalysisCache>,
    config: Arc<dyn ConfigProvider>,
}

impl<S, P> CachingAnalyzer<S, P>
where
    S: MessageSource,
    P: ClassificationProvider,
{
    pub fn new(
        source: S,
        provider: P,
        cache: Arc<AnalysisCache>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            source,
            provider,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<AnalysisCache> {
        &self.cache
    }

    /// Analyze one message by id.
    pub async fn analyze_message(
        &self,
        id: MessageId,
        settings: &ProviderSettings,
    ) -> Result<AnalysisResult> {
        let thresholds = ThresholdConfig::from_provider(self.config.as_ref())?;
        let content = self.source.fetch(id).await?;
        let key = content.cache_key(settings);

        let (classification, from_cache) = match self.cache.get(&key) {
            Some(entry) => {
                tracing::debug!(message_id = %id, key = %key, "Using cached analysis");
                (
                    Classification {
                        tags: entry.tags,
                        confidence: entry.overall_confidence,
                        reasoning: entry.reasoning,
                        tag_confidence: entry.tag_confidence,
                    },
                    true,
                )
            }
            None => {
                let fresh = self.provider.classify(&content, settings).await?;
                if !validate_confidence(fresh.confidence).valid {
                    return Err(RangeError::Confidence(fresh.confidence).into());
                }
                self.cache.set(
                    &key,
                    &fresh.tags,
                    fresh.confidence,
                    &fresh.reasoning,
                    Some(&fresh.tag_confidence),
                );
                (fresh, false)
            }
        };

        let (tags, skipped) = resolve_tags(
            &thresholds,
            &classification.tags,
            classification.confidence,
            &classification.tag_confidence,
        )?;

        tracing::debug!(
            message_id = %id,
            applied = tags.len(),
            skipped = skipped.len(),
            from_cache,
            "Analyzed message"
        );

        let mut tag_confidence = classification.tag_confidence;
        for tag in &classification.tags {
            tag_confidence
                .entry(tag.clone())
                .or_insert(classification.confidence);
        }

        Ok(AnalysisResult {
            tags,
            skipped,
            confidence: classification.confidence,
            reasoning: classification.reasoning,
            tag_confidence,
            from_cache,
        })
    }
}

impl<S, P> ItemAnalyzer for CachingAnalyzer<S, P>
where
    S: MessageSource + 'static,
    P: ClassificationProvider + 'static,
{
    async fn analyze(&self, item_id: &str, settings: &ProviderSettings) -> Result<AnalysisResult> {
        let id: MessageId = item_id.parse()?;
        self.analyze_message(id, settings).await
    }
}
