//! Memory record types - the durable unit of memory and its metadata.
//!
//! A [`MemoryRecord`] is one durable memory: an integer id (assigned by the
//! document store, the sole join key across all three indexes), a content
//! sentence, and structured metadata. The embedding vector lives only in the
//! dense index; components re-read records by id rather than holding them
//! across await points.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::now_ts;

// ============================================================================
// EVENT TYPE / STATUS
// ============================================================================

/// Kind of event a memory captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A discrete fact about the user or the world
    Fact,
    /// A stated preference
    Preference,
    /// A goal the user is pursuing
    Goal,
    /// An opinion or judgement
    Opinion,
    /// A change in the relationship between user and assistant
    Relationship,
    /// Anything else worth keeping
    #[default]
    #[serde(other)]
    Other,
}

impl EventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Fact => "fact",
            EventType::Preference => "preference",
            EventType::Goal => "goal",
            EventType::Opinion => "opinion",
            EventType::Relationship => "relationship",
            EventType::Other => "other",
        }
    }

    /// Parse from string name; unknown names map to `Other`
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "fact" => EventType::Fact,
            "preference" => EventType::Preference,
            "goal" => EventType::Goal,
            "opinion" => EventType::Opinion,
            "relationship" => EventType::Relationship,
            _ => EventType::Other,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    /// Live and eligible for recall
    #[default]
    Active,
    /// Kept but deprioritized
    Archived,
    /// Soft-deleted, pending physical removal
    Deleted,
}

impl MemoryStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Archived => "archived",
            MemoryStatus::Deleted => "deleted",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(MemoryStatus::Active),
            "archived" => Some(MemoryStatus::Archived),
            "deleted" => Some(MemoryStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// METADATA
// ============================================================================

/// A named entity referenced by a memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity name as it appeared in conversation
    pub name: String,
    /// Entity kind (person, place, project, ...)
    #[serde(rename = "type", default)]
    pub entity_type: String,
}

/// One entry in a record's update audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateHistoryEntry {
    /// Seconds since epoch when the update was applied
    pub timestamp: f64,
    /// Operator- or system-supplied reason
    pub reason: String,
    /// Fields that actually changed
    pub changed_fields: Vec<String>,
}

/// Structured metadata for one memory.
///
/// The known keys are typed; everything else the reflection pipeline (or an
/// operator) attaches survives round-trips through the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMetadata {
    /// Importance in [0, 1]; decays over time, clamped at 0
    #[serde(default)]
    pub importance: f64,
    /// Seconds since epoch at creation
    #[serde(default)]
    pub create_time: f64,
    /// Seconds since epoch of the last recall that returned this record
    #[serde(default)]
    pub last_access_time: f64,
    /// Seconds since epoch of the last field update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_time: Option<f64>,
    /// Conversation session the memory came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Persona active when the memory was formed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    /// Event classification
    #[serde(default)]
    pub event_type: EventType,
    /// Lifecycle status
    #[serde(default)]
    pub status: MemoryStatus,
    /// Entities mentioned by the memory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
    /// Ordered audit trail of field updates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_history: Vec<UpdateHistoryEntry>,
    /// Free-form additional keys
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for MemoryMetadata {
    fn default() -> Self {
        let now = now_ts();
        Self {
            importance: 0.5,
            create_time: now,
            last_access_time: now,
            last_updated_time: None,
            session_id: None,
            persona_id: None,
            event_type: EventType::default(),
            status: MemoryStatus::default(),
            entities: Vec::new(),
            update_history: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl MemoryMetadata {
    /// Fresh metadata for a newly formed memory.
    pub fn new(importance: f64, session_id: &str, persona_id: Option<&str>) -> Self {
        Self {
            importance: importance.clamp(0.0, 1.0),
            session_id: Some(session_id.to_string()),
            persona_id: persona_id.map(str::to_string),
            ..Default::default()
        }
    }

    /// Lenient parse from the stored JSON text. A malformed blob yields
    /// `None` so callers can decide whether to skip or substitute.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!("failed to parse memory metadata: {e}");
                None
            }
        }
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One durable memory as stored in the document table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Document-store id; the join key across dense, document, and sparse indexes
    pub id: i64,
    /// The "what happened" sentence
    pub content: String,
    /// Structured metadata
    pub metadata: MemoryMetadata,
}

/// A memory with a retrieval score attached.
///
/// `similarity` starts as the raw retrieval (or fused) score and is
/// overwritten with the final weighted score by the recall reranker.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    /// The retrieved record
    pub record: MemoryRecord,
    /// Retrieval score; rewritten in place by the reranker
    pub similarity: f32,
}

// ============================================================================
// REFLECTION WIRE TYPES
// ============================================================================

/// One event extracted by the reflection pipeline.
///
/// `temp_id` is assigned by the LLM during extraction and joins the event to
/// its evaluation score; it is never a storage id. The whole event is
/// persisted as the metadata payload of the resulting record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// LLM-assigned correlation id, unique within one extraction batch
    #[serde(alias = "id")]
    pub temp_id: String,
    /// The memory sentence, written in the first person
    pub memory_content: String,
    /// Event classification
    #[serde(default)]
    pub event_type: EventType,
    /// Entities the event references
    #[serde(default)]
    pub entities: Vec<Entity>,
    /// `temp_id`s of related events in the same batch
    #[serde(default)]
    pub related_event_ids: Vec<String>,
    /// Importance assigned by the evaluation stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance_score: Option<f64>,
    /// Anything else the model attached
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Extraction-stage response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEvents {
    /// Events found in the history snapshot
    #[serde(default)]
    pub events: Vec<MemoryEvent>,
}

/// Evaluation-stage response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatedScores {
    /// `temp_id` to importance in [0, 1]
    #[serde(default)]
    pub scores: std::collections::HashMap<String, f64>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for event_type in [
            EventType::Fact,
            EventType::Preference,
            EventType::Goal,
            EventType::Opinion,
            EventType::Relationship,
            EventType::Other,
        ] {
            assert_eq!(EventType::parse_name(event_type.as_str()), event_type);
        }
        assert_eq!(EventType::parse_name("???"), EventType::Other);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(MemoryStatus::parse_name("Archived"), Some(MemoryStatus::Archived));
        assert_eq!(MemoryStatus::parse_name("gone"), None);
    }

    #[test]
    fn test_metadata_json_roundtrip_preserves_extra_keys() {
        let mut meta = MemoryMetadata::new(0.8, "session-1", Some("persona-a"));
        meta.extra
            .insert("mood".to_string(), Value::String("curious".to_string()));

        let json = serde_json::to_string(&meta).unwrap();
        let parsed: MemoryMetadata = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.importance, 0.8);
        assert_eq!(parsed.session_id.as_deref(), Some("session-1"));
        assert_eq!(parsed.extra.get("mood"), Some(&Value::String("curious".into())));
    }

    #[test]
    fn test_metadata_parse_lenient_rejects_garbage() {
        assert!(MemoryMetadata::parse_lenient("not json").is_none());
        assert!(MemoryMetadata::parse_lenient("{}").is_some());
    }

    #[test]
    fn test_event_accepts_llm_id_alias() {
        let json = r#"{"events":[{"id":"e1","memory_content":"User is learning Rust","event_type":"preference"}]}"#;
        let parsed: ExtractedEvents = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.events[0].temp_id, "e1");
        assert_eq!(parsed.events[0].event_type, EventType::Preference);
    }

    #[test]
    fn test_unknown_event_type_defaults_to_other() {
        let json = r#"{"temp_id":"x","memory_content":"c","event_type":"celebration"}"#;
        let event: MemoryEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, EventType::Other);
    }
}
