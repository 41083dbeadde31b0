//! Reflection engine - distilling durable memory events from conversation
//! history.
//!
//! Two-stage LLM contract over a frozen history snapshot:
//! 1. **Extraction**: the model returns a list of independent memory events,
//!    each with a model-assigned `temp_id`.
//! 2. **Evaluation**: the model scores each event's long-term importance in
//!    [0, 1], keyed by `temp_id`.
//!
//! Events at or above the importance threshold are persisted through the
//! memory manager with the full event as their metadata payload. Parse
//! failures at either stage yield an empty result for that stage - the
//! caller owns retries of the whole reflection, not of a single stage.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::config::ReflectionEngineConfig;
use crate::error::Result;
use crate::memory::{EvaluatedScores, ExtractedEvents, MemoryEvent, MemoryMetadata};
use crate::provider::Chatter;
use crate::session::ChatTurn;
use crate::storage::memory_manager::MemoryManager;
use crate::util::extract_json_from_response;

const DEFAULT_EXTRACTION_PROMPT: &str = "You are an analyst distilling durable memories from a \
conversation. Read the dialogue history and extract independent, meaningful memory events: \
facts, user preferences, goals, opinions, or changes in the relationship. Write each event as \
one self-contained sentence. Return strictly the specified JSON, with no scoring information \
and no extra commentary.";

const DEFAULT_EVALUATION_PROMPT: &str = "Rate how valuable each memory entry is as long-term \
reference for future conversations. Give each a score between 0.0 and 1.0, where 1.0 is \
critically important and 0.0 is worthless. Return strictly the specified JSON.";

/// JSON shape the extraction stage must return
const EXTRACTION_SCHEMA: &str = r#"{
  "type": "object",
  "properties": {
    "events": {
      "type": "array",
      "items": {
        "type": "object",
        "properties": {
          "temp_id": {"type": "string", "description": "unique id for this event within this response"},
          "memory_content": {"type": "string", "description": "one self-contained sentence"},
          "event_type": {"type": "string", "enum": ["fact", "preference", "goal", "opinion", "relationship", "other"]},
          "entities": {"type": "array", "items": {"type": "object", "properties": {"name": {"type": "string"}, "type": {"type": "string"}}}},
          "related_event_ids": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["temp_id", "memory_content", "event_type"]
      }
    }
  },
  "required": ["events"]
}"#;

/// JSON shape the evaluation stage must return
const EVALUATION_SCHEMA: &str = r#"{
  "type": "object",
  "properties": {
    "scores": {
      "type": "object",
      "additionalProperties": {"type": "number", "minimum": 0.0, "maximum": 1.0},
      "description": "map from temp_id to importance score"
    }
  },
  "required": ["scores"]
}"#;

/// Two-stage extract/score pipeline
pub struct ReflectionEngine {
    config: ReflectionEngineConfig,
    chatter: Arc<dyn Chatter>,
    memory: Arc<MemoryManager>,
}

impl ReflectionEngine {
    /// Wire the engine over the chat capability and the memory manager.
    pub fn new(
        config: ReflectionEngineConfig,
        chatter: Arc<dyn Chatter>,
        memory: Arc<MemoryManager>,
    ) -> Self {
        Self {
            config,
            chatter,
            memory,
        }
    }

    /// Run the full reflect-evaluate-store flow over a history snapshot.
    /// Returns the number of events persisted.
    pub async fn reflect_and_store(
        &self,
        history: &[ChatTurn],
        session_id: &str,
        persona_id: Option<&str>,
        persona_prompt: Option<&str>,
    ) -> Result<usize> {
        let history_text = format_history(history);
        if history_text.is_empty() {
            tracing::debug!("[{session_id}] empty history, skipping reflection");
            return Ok(0);
        }

        tracing::info!("[{session_id}] reflection stage 1: extracting memory events");
        let events = self.extract_events(&history_text, persona_prompt).await?;
        if events.is_empty() {
            tracing::info!("[{session_id}] no memory events extracted");
            return Ok(0);
        }
        tracing::info!("[{session_id}] extracted {} memory events", events.len());

        tracing::info!("[{session_id}] reflection stage 2: evaluating importance");
        let scores = self.evaluate_scores(&events, persona_prompt).await?;
        tracing::info!("[{session_id}] received {} scores", scores.len());

        let threshold = self.config.importance_threshold;
        let mut stored = 0usize;
        let mut ignored = 0usize;
        for mut event in events {
            let Some(&score) = scores.get(&event.temp_id) else {
                tracing::warn!(
                    "[{session_id}] event {:?} has no score, skipping",
                    event.temp_id
                );
                continue;
            };
            event.importance_score = Some(score);

            if score >= threshold {
                let metadata = event_metadata(&event, score, session_id, persona_id);
                let id = self
                    .memory
                    .add_with_metadata(&event.memory_content, metadata)
                    .await?;
                stored += 1;
                tracing::debug!(
                    "[{session_id}] stored memory event as id {id} (score {score:.2})"
                );
            } else {
                ignored += 1;
                tracing::debug!(
                    "[{session_id}] ignored event {:?}, score {score:.2} below threshold {threshold:.2}",
                    event.temp_id
                );
            }
        }

        tracing::info!("[{session_id}] reflection stored {stored} events, ignored {ignored}");
        Ok(stored)
    }

    /// Stage 1: extract a batch of events from the formatted history.
    /// Validation failure logs and returns an empty list.
    async fn extract_events(
        &self,
        history_text: &str,
        persona_prompt: Option<&str>,
    ) -> Result<Vec<MemoryEvent>> {
        let system_prompt = self.build_extraction_prompt(persona_prompt);
        let user_prompt =
            format!("Here is the conversation history to analyze:\n{history_text}");

        let response = self.chatter.chat(&user_prompt, &system_prompt, true).await?;
        let json_text = extract_json_from_response(&response);

        match serde_json::from_str::<ExtractedEvents>(json_text) {
            Ok(extracted) => Ok(extracted.events),
            Err(e) => {
                tracing::error!("event extraction JSON did not validate: {e}; raw: {response}");
                Ok(Vec::new())
            }
        }
    }

    /// Stage 2: score a batch of events. Validation failure logs and returns
    /// an empty map (every event is then skipped with a warning).
    async fn evaluate_scores(
        &self,
        events: &[MemoryEvent],
        persona_prompt: Option<&str>,
    ) -> Result<HashMap<String, f64>> {
        if events.is_empty() {
            return Ok(HashMap::new());
        }

        let system_prompt = self.build_evaluation_prompt(persona_prompt);
        let memories: Vec<_> = events
            .iter()
            .map(|e| json!({"id": e.temp_id, "content": e.memory_content}))
            .collect();
        let user_prompt = serde_json::to_string_pretty(&json!({ "memories": memories }))?;

        let response = self.chatter.chat(&user_prompt, &system_prompt, true).await?;
        let json_text = extract_json_from_response(&response);

        match serde_json::from_str::<EvaluatedScores>(json_text) {
            Ok(evaluated) => Ok(evaluated.scores),
            Err(e) => {
                tracing::error!("score evaluation JSON did not validate: {e}; raw: {response}");
                Ok(HashMap::new())
            }
        }
    }

    fn build_extraction_prompt(&self, persona_prompt: Option<&str>) -> String {
        let base = self
            .config
            .event_extraction_prompt
            .as_deref()
            .unwrap_or(DEFAULT_EXTRACTION_PROMPT)
            .trim();
        let persona_section = persona_section(persona_prompt);

        format!(
            "{base}\n{persona_section}\
             Instructions:\n\
             1. Extract the key events from the dialogue history below.\n\
             2. Return a single JSON object matching this schema, assigning every event a unique `temp_id` string.\n\n\
             Response schema:\n```json\n{EXTRACTION_SCHEMA}\n```"
        )
    }

    fn build_evaluation_prompt(&self, persona_prompt: Option<&str>) -> String {
        let base = self
            .config
            .evaluation_prompt
            .as_deref()
            .unwrap_or(DEFAULT_EVALUATION_PROMPT)
            .trim();
        let persona_section = persona_section(persona_prompt);

        format!(
            "{base}\n{persona_section}\
             Instructions:\n\
             1. The input is a JSON object holding memory entries, each with an `id` and `content`.\n\
             2. Score every entry's long-term value for future conversations between 0.0 and 1.0.\n\
             3. Return a single JSON object matching this schema, keyed by the corresponding `id`.\n\n\
             Response schema:\n```json\n{EVALUATION_SCHEMA}\n```\n\n\
             Example response:\n```json\n{{\"scores\": {{\"event_1\": 0.8, \"user_preference_1\": 0.9}}}}\n```"
        )
    }
}

fn persona_section(persona_prompt: Option<&str>) -> String {
    match persona_prompt {
        Some(prompt) => {
            format!("Adopt this persona while analyzing:\n<persona>{prompt}</persona>\n")
        }
        None => String::new(),
    }
}

/// Flatten the history into `role: content` lines, keeping only user and
/// assistant turns.
fn format_history(history: &[ChatTurn]) -> String {
    history
        .iter()
        .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the metadata payload for a persisted event: the base fields plus
/// the full event dict carried through.
fn event_metadata(
    event: &MemoryEvent,
    score: f64,
    session_id: &str,
    persona_id: Option<&str>,
) -> MemoryMetadata {
    let mut metadata = MemoryMetadata::new(score, session_id, persona_id);
    metadata.event_type = event.event_type;
    metadata.entities = event.entities.clone();
    metadata
        .extra
        .insert("temp_id".to_string(), json!(event.temp_id));
    if !event.related_event_ids.is_empty() {
        metadata.extra.insert(
            "related_event_ids".to_string(),
            json!(event.related_event_ids),
        );
    }
    for (key, value) in &event.extra {
        metadata.extra.insert(key.clone(), value.clone());
    }
    metadata
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EventType;
    use crate::provider::Embedder;
    use crate::session::Role;
    use crate::storage::document_store::DocumentStore;
    use crate::storage::vector_index::VectorIndex;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const DIMS: usize = 8;

    struct HashEmbedder;

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn dimensions(&self) -> usize {
            DIMS
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; DIMS];
            for (i, b) in text.bytes().enumerate() {
                v[(i + b as usize) % DIMS] += 1.0;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
            Ok(v.into_iter().map(|x| x / norm).collect())
        }
    }

    /// Chatter that replays a scripted sequence of responses.
    struct ScriptedChatter {
        responses: Mutex<std::collections::VecDeque<String>>,
    }

    impl ScriptedChatter {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl Chatter for ScriptedChatter {
        async fn chat(&self, _prompt: &str, _system: &str, _json_mode: bool) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| crate::error::MemoryError::External("no scripted response".into()))
        }
    }

    fn manager(dir: &tempfile::TempDir) -> Arc<MemoryManager> {
        let docs = Arc::new(DocumentStore::open(&dir.path().join("lm.db")).unwrap());
        Arc::new(MemoryManager::new(
            docs,
            VectorIndex::new(DIMS).unwrap(),
            Arc::new(HashEmbedder),
            dir.path().join("lm.index"),
        ))
    }

    fn turns() -> Vec<ChatTurn> {
        vec![
            ChatTurn {
                role: Role::User,
                content: "I'm learning Rust".to_string(),
            },
            ChatTurn {
                role: Role::Assistant,
                content: "That's great! How is it going?".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn test_full_pipeline_persists_scored_event() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        let chatter = Arc::new(ScriptedChatter::new(vec![
            // Stage A, fenced like a sloppy JSON-mode provider.
            "```json\n{\"events\": [{\"temp_id\": \"T\", \"memory_content\": \"User is learning Rust\", \"event_type\": \"preference\"}]}\n```",
            // Stage B.
            r#"{"scores": {"T": 0.85}}"#,
        ]));
        let engine = ReflectionEngine::new(
            ReflectionEngineConfig::default(),
            chatter,
            Arc::clone(&memory),
        );

        let stored = engine
            .reflect_and_store(&turns(), "S2", None, None)
            .await
            .unwrap();
        assert_eq!(stored, 1);

        let records = memory.paginate(10, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "User is learning Rust");
        assert_eq!(records[0].metadata.importance, 0.85);
        assert_eq!(records[0].metadata.event_type, EventType::Preference);
        assert_eq!(records[0].metadata.session_id.as_deref(), Some("S2"));
        assert_eq!(
            records[0].metadata.extra.get("temp_id"),
            Some(&json!("T"))
        );
    }

    #[tokio::test]
    async fn test_below_threshold_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        let chatter = Arc::new(ScriptedChatter::new(vec![
            r#"{"events": [{"temp_id": "a", "memory_content": "smalltalk about weather", "event_type": "other"}]}"#,
            r#"{"scores": {"a": 0.1}}"#,
        ]));
        let engine = ReflectionEngine::new(
            ReflectionEngineConfig::default(),
            chatter,
            Arc::clone(&memory),
        );

        let stored = engine.reflect_and_store(&turns(), "S1", None, None).await.unwrap();
        assert_eq!(stored, 0);
        assert_eq!(memory.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_score_skips_event() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        let chatter = Arc::new(ScriptedChatter::new(vec![
            r#"{"events": [
                {"temp_id": "a", "memory_content": "User is learning Rust", "event_type": "preference"},
                {"temp_id": "b", "memory_content": "User lives in Lisbon", "event_type": "fact"}
            ]}"#,
            r#"{"scores": {"b": 0.9}}"#,
        ]));
        let engine = ReflectionEngine::new(
            ReflectionEngineConfig::default(),
            chatter,
            Arc::clone(&memory),
        );

        let stored = engine.reflect_and_store(&turns(), "S1", None, None).await.unwrap();
        assert_eq!(stored, 1);
        let records = memory.paginate(10, 0).unwrap();
        assert_eq!(records[0].content, "User lives in Lisbon");
    }

    #[tokio::test]
    async fn test_malformed_extraction_yields_zero_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        let chatter = Arc::new(ScriptedChatter::new(vec!["this is not json at all"]));
        let engine = ReflectionEngine::new(
            ReflectionEngineConfig::default(),
            chatter,
            Arc::clone(&memory),
        );

        let stored = engine.reflect_and_store(&turns(), "S1", None, None).await.unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn test_empty_history_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        // No scripted responses: the chatter must never be called.
        let chatter = Arc::new(ScriptedChatter::new(vec![]));
        let engine = ReflectionEngine::new(
            ReflectionEngineConfig::default(),
            chatter,
            Arc::clone(&memory),
        );

        let stored = engine.reflect_and_store(&[], "S1", None, None).await.unwrap();
        assert_eq!(stored, 0);
    }

    #[test]
    fn test_persona_appears_in_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ReflectionEngine::new(
            ReflectionEngineConfig::default(),
            Arc::new(ScriptedChatter::new(vec![])),
            manager(&dir),
        );
        let prompt = engine.build_extraction_prompt(Some("You are a pirate."));
        assert!(prompt.contains("<persona>You are a pirate.</persona>"));
        let prompt = engine.build_evaluation_prompt(None);
        assert!(!prompt.contains("<persona>"));
    }
}
