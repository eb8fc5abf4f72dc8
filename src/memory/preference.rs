//! Medium-term memory: per-user learned preferences.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record per user. Updates are merges; see [`PreferenceRecord::fold`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub user_id: String,
    pub preferred_tags: BTreeSet<String>,
    /// topic → relevance in [0, 1].
    pub preferred_topics: BTreeMap<String, f64>,
    pub interaction_patterns: BTreeMap<String, serde_json::Value>,
    pub confidence_score: f64,
    pub sample_size: u64,
    pub last_updated: DateTime<Utc>,
    /// Most recent observation IDs already folded in, oldest first.
    #[serde(default)]
    pub applied_observations: Vec<String>,
    /// Optimistic-concurrency counter, bumped on every write.
    #[serde(skip)]
    pub version: i64,
}

/// A weighted observation derived from one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceSignal {
    /// topic → weight, clamped into [0, 1] when folded.
    #[serde(default)]
    pub topics: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Interaction label such as `view` or `like`.
    #[serde(default)]
    pub source: Option<String>,
    /// Identity of this observation. A signal whose ID the record has
    /// already seen is not folded again.
    #[serde(default)]
    pub observation_id: Option<String>,
}

impl PreferenceSignal {
    pub fn topic(mut self, topic: impl Into<String>, weight: f64) -> Self {
        self.topics.insert(topic.into(), weight);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn observation(mut self, id: impl Into<String>) -> Self {
        self.observation_id = Some(id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.tags.is_empty()
    }
}

/// How many observation IDs a record remembers for de-duplication.
pub const RECENT_OBSERVATIONS: usize = 64;

/// Append `id`, dropping the oldest entries past [`RECENT_OBSERVATIONS`].
pub(crate) fn remember_observation(seen: &mut Vec<String>, id: &str) {
    seen.push(id.to_string());
    if seen.len() > RECENT_OBSERVATIONS {
        let excess = seen.len() - RECENT_OBSERVATIONS;
        seen.drain(..excess);
    }
}

/// `1 - k/(k+n)`: grows toward 1 with the sample size and never reaches it.
pub fn saturating_confidence(sample_size: u64, saturation: f64) -> f64 {
    let k = if saturation > 0.0 { saturation } else { 1.0 };
    let n = sample_size as f64;
    (1.0 - k / (k + n)).clamp(0.0, 1.0)
}

impl PreferenceRecord {
    /// The default record for a user with no observations.
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            preferred_tags: BTreeSet::new(),
            preferred_topics: BTreeMap::new(),
            interaction_patterns: BTreeMap::new(),
            confidence_score: 0.0,
            sample_size: 0,
            last_updated: Utc::now(),
            applied_observations: Vec::new(),
            version: 0,
        }
    }

    /// Fold one observation into the record.
    ///
    /// Each topic in the signal moves to the running average
    /// `(old * n + w) / (n + 1)`, so a single outlier can't overwhelm an
    /// established preference. Topics not in the signal keep their score.
    ///
    /// Returns `false`, leaving the record untouched, when the signal's
    /// observation ID was already folded in.
    pub fn fold(&mut self, signal: &PreferenceSignal, saturation: f64, now: DateTime<Utc>) -> bool {
        if let Some(id) = &signal.observation_id {
            if self.applied_observations.contains(id) {
                return false;
            }
            remember_observation(&mut self.applied_observations, id);
        }

        let n = self.sample_size as f64;
        for (topic, weight) in &signal.topics {
            let weight = if weight.is_finite() { weight.clamp(0.0, 1.0) } else { 0.0 };
            let old = self.preferred_topics.get(topic).copied().unwrap_or(0.0);
            let updated = ((old * n + weight) / (n + 1.0)).clamp(0.0, 1.0);
            self.preferred_topics.insert(topic.clone(), updated);
        }

        self.preferred_tags.extend(signal.tags.iter().cloned());

        if let Some(source) = &signal.source {
            let count = self
                .interaction_patterns
                .get(source)
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.interaction_patterns
                .insert(source.clone(), serde_json::json!(count + 1));
        }

        self.sample_size += 1;
        self.confidence_score = saturating_confidence(self.sample_size, saturation)
            .max(self.confidence_score);
        self.last_updated = now;
        true
    }

    /// Topics sorted by descending relevance.
    pub fn top_topics(&self, limit: usize) -> Vec<(String, f64)> {
        let mut topics: Vec<(String, f64)> = self
            .preferred_topics
            .iter()
            .map(|(t, s)| (t.clone(), *s))
            .collect();
        topics.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        topics.truncate(limit);
        topics
    }
}
