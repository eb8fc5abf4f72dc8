//! Long-term memory: durable per-group knowledge records.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{canonical_json, content_hash};
use crate::memory::preference::{remember_observation, saturating_confidence};

/// Category of a knowledge record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    EntityTags,
    MediaDescription,
    Sentiment,
    Relationship,
    General,
}

impl KnowledgeType {
    pub const ALL: [KnowledgeType; 5] = [
        KnowledgeType::EntityTags,
        KnowledgeType::MediaDescription,
        KnowledgeType::Sentiment,
        KnowledgeType::Relationship,
        KnowledgeType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntityTags => "entity_tags",
            Self::MediaDescription => "media_description",
            Self::Sentiment => "sentiment",
            Self::Relationship => "relationship",
            Self::General => "general",
        }
    }
}

impl fmt::Display for KnowledgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KnowledgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KnowledgeType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown knowledge type '{s}'"))
    }
}

/// Moderation state. Observations never change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Unverified,
    Verified,
    Disputed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Disputed => "disputed",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unverified" => Ok(Self::Unverified),
            "verified" => Ok(Self::Verified),
            "disputed" => Ok(Self::Disputed),
            other => Err(format!("unknown verification status '{other}'")),
        }
    }
}

/// One observation of a fact, as produced by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub knowledge_type: KnowledgeType,
    pub knowledge_data: serde_json::Value,
    /// Confidence of this single observation, in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub related_entity_ids: Vec<String>,
    #[serde(default)]
    pub source_event_id: Option<String>,
    /// Caller-chosen identity; derived from type + content when absent.
    #[serde(default)]
    pub dedup_key: Option<String>,
    /// Identity of this observation, for facts without a source event.
    #[serde(default)]
    pub observation_id: Option<String>,
}

impl Fact {
    pub fn new(knowledge_type: KnowledgeType, data: serde_json::Value, confidence: f64) -> Self {
        Self {
            knowledge_type,
            knowledge_data: data,
            confidence,
            related_entity_ids: Vec::new(),
            source_event_id: None,
            dedup_key: None,
            observation_id: None,
        }
    }

    pub fn related_to(mut self, entity_id: impl Into<String>) -> Self {
        self.related_entity_ids.push(entity_id.into());
        self
    }

    pub fn from_event(mut self, event_id: impl Into<String>) -> Self {
        self.source_event_id = Some(event_id.into());
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn observation(mut self, id: impl Into<String>) -> Self {
        self.observation_id = Some(id.into());
        self
    }

    /// Identity of "the same fact" within a group.
    pub fn dedup_key(&self) -> String {
        match &self.dedup_key {
            Some(key) => key.clone(),
            None => fingerprint(self.knowledge_type, &self.knowledge_data),
        }
    }

    fn clamped_confidence(&self) -> f64 {
        if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// `knowledge_type` plus a SHA-256 fingerprint of the canonical payload.
pub fn fingerprint(knowledge_type: KnowledgeType, data: &serde_json::Value) -> String {
    format!(
        "{}:{}",
        knowledge_type,
        content_hash(canonical_json(data).as_bytes())
    )
}

/// A durable fact, merged across observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub id: Uuid,
    pub group_id: String,
    pub dedup_key: String,
    pub knowledge_type: KnowledgeType,
    pub knowledge_data: serde_json::Value,
    pub related_entity_ids: BTreeSet<String>,
    pub confidence_score: f64,
    /// Append-only, duplicate-free, in arrival order.
    pub source_event_ids: Vec<String>,
    pub verification_status: VerificationStatus,
    pub first_observed: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
    pub observation_count: u64,
    /// Most recent observation IDs already merged, oldest first.
    #[serde(default)]
    pub applied_observations: Vec<String>,
    #[serde(skip)]
    pub version: i64,
}

/// What a merge did to the stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadChange {
    Kept,
    Replaced,
    /// The observation was already merged; nothing changed.
    AlreadyObserved,
}

impl KnowledgeRecord {
    /// First observation of a fact.
    pub fn first(group_id: impl Into<String>, fact: &Fact, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            dedup_key: fact.dedup_key(),
            knowledge_type: fact.knowledge_type,
            knowledge_data: fact.knowledge_data.clone(),
            related_entity_ids: fact.related_entity_ids.iter().cloned().collect(),
            confidence_score: fact.clamped_confidence(),
            source_event_ids: fact.source_event_id.iter().cloned().collect(),
            verification_status: VerificationStatus::Unverified,
            first_observed: now,
            last_observed: now,
            observation_count: 1,
            applied_observations: fact.observation_id.iter().cloned().collect(),
            version: 0,
        }
    }

    /// Merge a re-observation of the same fact.
    ///
    /// The payload is replaced only when the new observation is strictly more
    /// confident than the stored record; ties keep the existing payload.
    /// Confidence never decreases and never exceeds 1.0. An event, or an
    /// observation ID, that was already merged counts once.
    pub fn merge(&mut self, fact: &Fact, saturation: f64, now: DateTime<Utc>) -> PayloadChange {
        if self.has_observed(fact) {
            return PayloadChange::AlreadyObserved;
        }
        if let Some(id) = &fact.observation_id {
            remember_observation(&mut self.applied_observations, id);
        }

        let incoming = fact.clamped_confidence();
        let change = if incoming > self.confidence_score {
            self.knowledge_data = fact.knowledge_data.clone();
            PayloadChange::Replaced
        } else {
            PayloadChange::Kept
        };

        if let Some(event_id) = &fact.source_event_id {
            self.source_event_ids.push(event_id.clone());
        }
        self.related_entity_ids
            .extend(fact.related_entity_ids.iter().cloned());
        self.observation_count += 1;
        self.confidence_score = self
            .confidence_score
            .max(incoming)
            .max(saturating_confidence(self.observation_count, saturation))
            .min(1.0);
        if now > self.last_observed {
            self.last_observed = now;
        }

        change
    }

    fn has_observed(&self, fact: &Fact) -> bool {
        fact.source_event_id
            .as_ref()
            .is_some_and(|id| self.source_event_ids.contains(id))
            || fact
                .observation_id
                .as_ref()
                .is_some_and(|id| self.applied_observations.contains(id))
    }
}
