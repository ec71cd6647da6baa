//! Confidence/threshold policy.
//!
//! Classifiers report confidence as a float in `[0, 1]`; users configure
//! thresholds as integer percentages in `[0, 100]`. A tag is applied when its
//! rounded percentage meets the effective threshold for that tag: the per-tag
//! override if one exists, otherwise the global threshold, otherwise 70.
//!
//! Everything here is pure. Out-of-range input is an error, never clamped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ConfigProvider;
use crate::error::{RangeError, Result, TaggerError};

/// Threshold used when neither an override nor a global value is configured.
pub const DEFAULT_THRESHOLD: i32 = 70;

const HIGH_LEVEL_MIN: i32 = 80;
const MEDIUM_LEVEL_MIN: i32 = 70;

/// Display-only confidence bucket. Never used to decide tag application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &str {
        match self {
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::Low => "low",
        }
    }
}

/// Outcome of a validation check, for callers that prefer skipping bad
/// entries over failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub message: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    fn invalid(err: RangeError) -> Self {
        Self {
            valid: false,
            message: Some(err.to_string()),
        }
    }
}

fn check_confidence(confidence: f64) -> std::result::Result<f64, RangeError> {
    // NaN fails the range check as well.
    if (0.0..=1.0).contains(&confidence) {
        Ok(confidence)
    } else {
        Err(RangeError::Confidence(confidence))
    }
}

fn check_threshold(percent: i32) -> std::result::Result<i32, RangeError> {
    if (0..=100).contains(&percent) {
        Ok(percent)
    } else {
        Err(RangeError::Threshold(percent as i64))
    }
}

/// Convert a confidence in `[0, 1]` to an integer percentage, rounding half up.
///
/// The product is first snapped to six decimals so that binary representation
/// error cannot move a value across the half boundary (`0.695 * 100` is
/// `69.49999999999999` in `f64` but rounds to 70 here).
pub fn confidence_to_percentage(confidence: f64) -> Result<i32> {
    let confidence = check_confidence(confidence)?;
    let snapped = (confidence * 100.0 * 1e6).round() / 1e6;
    Ok((snapped + 0.5).floor() as i32)
}

/// Convert an integer percentage in `[0, 100]` back to a confidence.
pub fn percentage_to_confidence(percent: i32) -> Result<f64> {
    let percent = check_threshold(percent)?;
    Ok(percent as f64 / 100.0)
}

/// Whether `confidence` meets `threshold_percent` after rounding.
pub fn meets_threshold(confidence: f64, threshold_percent: i32) -> Result<bool> {
    let threshold = check_threshold(threshold_percent)?;
    Ok(confidence_to_percentage(confidence)? >= threshold)
}

/// Pick the threshold that applies to a tag.
pub fn effective_threshold(per_tag_override: Option<i32>, global_threshold: Option<i32>) -> i32 {
    per_tag_override
        .or(global_threshold)
        .unwrap_or(DEFAULT_THRESHOLD)
}

/// [`meets_threshold`] against the tag's [`effective_threshold`].
pub fn meets_tag_threshold(
    confidence: f64,
    per_tag_override: Option<i32>,
    global_threshold: Option<i32>,
) -> Result<bool> {
    meets_threshold(
        confidence,
        effective_threshold(per_tag_override, global_threshold),
    )
}

/// Check a threshold percentage without failing. `message` says why it is invalid.
pub fn validate_threshold(percent: i32) -> Validation {
    match check_threshold(percent) {
        Ok(_) => Validation::ok(),
        Err(e) => Validation::invalid(e),
    }
}

/// Check a confidence score without failing. NaN is invalid.
pub fn validate_confidence(confidence: f64) -> Validation {
    match check_confidence(confidence) {
        Ok(_) => Validation::ok(),
        Err(e) => Validation::invalid(e),
    }
}

/// Bucket a confidence for display: High at 80%+, Medium at 70-79%, Low below.
pub fn classify_level(confidence: f64) -> Result<ConfidenceLevel> {
    let percent = confidence_to_percentage(confidence)?;
    Ok(if percent >= HIGH_LEVEL_MIN {
        ConfidenceLevel::High
    } else if percent >= MEDIUM_LEVEL_MIN {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    })
}

/// Per-tag verdict produced by [`ThresholdConfig::decide`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagDecision {
    pub tag: String,
    pub confidence: f64,
    pub threshold: i32,
    pub apply: bool,
}

/// Thresholds in effect for one classification decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThresholdConfig {
    pub global: Option<i32>,
    pub overrides: BTreeMap<String, i32>,
}

impl ThresholdConfig {
    pub fn new(global: Option<i32>) -> Self {
        Self {
            global,
            overrides: BTreeMap::new(),
        }
    }

    /// Add a per-tag override (builder pattern).
    pub fn with_override(mut self, tag: impl Into<String>, percent: i32) -> Self {
        self.overrides.insert(tag.into(), percent);
        self
    }

    /// Snapshot thresholds from a configuration provider.
    ///
    /// An out-of-range global threshold fails the load. Out-of-range overrides
    /// are dropped with a warning so that one bad entry does not disable tagging.
    pub fn from_provider(provider: &dyn ConfigProvider) -> Result<Self> {
        let global = provider.global_threshold()?;
        if let Some(g) = global {
            check_threshold(g)?;
        }

        let mut overrides = BTreeMap::new();
        for (tag, percent) in provider.tag_overrides()? {
            let check = validate_threshold(percent);
            if check.valid {
                overrides.insert(tag, percent);
            } else {
                tracing::warn!(
                    tag = %tag,
                    reason = check.message.as_deref().unwrap_or_default(),
                    "Ignoring invalid tag threshold override"
                );
            }
        }

        Ok(Self { global, overrides })
    }

    /// The tag's override if one exists, else the global threshold, else 70.
    pub fn threshold_for(&self, tag: &str) -> i32 {
        effective_threshold(self.overrides.get(tag).copied(), self.global)
    }

    pub fn decide(&self, tag: &str, confidence: f64) -> Result<TagDecision> {
        let threshold = self.threshold_for(tag);
        Ok(TagDecision {
            tag: tag.to_string(),
            confidence,
            threshold,
            apply: meets_threshold(confidence, threshold)?,
        })
    }
}

/// Split proposed tags into those to apply and those to skip.
///
/// Tags without a per-tag score are judged on `overall`. A per-tag score that
/// is out of range drops that tag with a warning; an out-of-range `overall`
/// fails the whole call.
pub fn resolve_tags(
    thresholds: &ThresholdConfig,
    tags: &[String],
    overall: f64,
    tag_confidence: &BTreeMap<String, f64>,
) -> Result<(Vec<String>, Vec<TagDecision>)> {
    check_confidence(overall).map_err(TaggerError::from)?;

    let mut applied = Vec::new();
    let mut skipped = Vec::new();
    for tag in tags {
        let confidence = tag_confidence.get(tag).copied().unwrap_or(overall);
        let decision = match thresholds.decide(tag, confidence) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(tag = %tag, error = %e, "Dropping tag with invalid confidence");
                continue;
            }
        };
        if decision.apply {
            applied.push(decision.tag);
        } else {
            skipped.push(decision);
        }
    }
    Ok((applied, skipped))
}
