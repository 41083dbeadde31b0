//! Session manager - bounded per-conversation rolling history.
//!
//! Each session carries its dialogue history and a turn counter that drives
//! reflection triggering. The map is bounded two ways on every access:
//! sessions idle past the TTL are dropped first, then the oldest-touched
//! sessions until the count fits `max_sessions`. All state lives behind one
//! mutex; mutations are short and never await.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::SessionManagerConfig;
use crate::util::now_ts;

/// Speaker of one dialogue turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human side
    User,
    /// The model side
    Assistant,
}

impl Role {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One dialogue turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who spoke
    pub role: Role,
    /// What was said
    pub content: String,
}

#[derive(Debug, Default)]
struct SessionState {
    history: Vec<ChatTurn>,
    round_count: u32,
    last_touched: f64,
}

/// Bounded map of live sessions
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionState>>,
    config: SessionManagerConfig,
}

impl SessionManager {
    /// Create an empty manager with the given bounds.
    pub fn new(config: SessionManagerConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionState>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop expired sessions, then enforce the size cap by evicting the
    /// oldest-touched. Runs on every access.
    fn cleanup(sessions: &mut HashMap<String, SessionState>, config: &SessionManagerConfig, now: f64) {
        sessions.retain(|_, state| now - state.last_touched <= config.session_ttl as f64);

        if sessions.len() > config.max_sessions {
            let mut by_age: Vec<(String, f64)> = sessions
                .iter()
                .map(|(id, state)| (id.clone(), state.last_touched))
                .collect();
            by_age.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let excess = sessions.len() - config.max_sessions;
            for (id, _) in by_age.into_iter().take(excess) {
                sessions.remove(&id);
            }
        }
    }

    /// Touch-or-create a session and run `f` against its state. Cleanup
    /// runs after the touch, so the bound holds at every return and the
    /// just-touched session (being the newest) is never the one evicted.
    fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut SessionState) -> T) -> T {
        let now = now_ts();
        let mut sessions = self.lock();

        let state = sessions.entry(session_id.to_string()).or_default();
        state.last_touched = now;
        let result = f(state);

        Self::cleanup(&mut sessions, &self.config, now);
        result
    }

    /// Append a user turn to the session's history.
    pub fn append_user_turn(&self, session_id: &str, content: &str) {
        self.with_session(session_id, |state| {
            state.history.push(ChatTurn {
                role: Role::User,
                content: content.to_string(),
            });
        });
    }

    /// Append an assistant turn and bump the round counter. Returns the new
    /// round count.
    pub fn append_assistant_turn(&self, session_id: &str, content: &str) -> u32 {
        self.with_session(session_id, |state| {
            state.history.push(ChatTurn {
                role: Role::Assistant,
                content: content.to_string(),
            });
            state.round_count += 1;
            state.round_count
        })
    }

    /// Clone the session's history (the frozen snapshot handed to
    /// reflection).
    pub fn snapshot_history(&self, session_id: &str) -> Vec<ChatTurn> {
        self.with_session(session_id, |state| state.history.clone())
    }

    /// Current round count without touching history.
    pub fn round_count(&self, session_id: &str) -> u32 {
        self.with_session(session_id, |state| state.round_count)
    }

    /// Clear history and counter but keep the slot alive.
    pub fn reset(&self, session_id: &str) {
        self.with_session(session_id, |state| {
            state.history.clear();
            state.round_count = 0;
        });
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_sessions: usize, session_ttl: u64) -> SessionManager {
        SessionManager::new(SessionManagerConfig {
            max_sessions,
            session_ttl,
        })
    }

    #[test]
    fn test_history_and_round_counting() {
        let m = manager(10, 3600);
        m.append_user_turn("s1", "hello");
        let rounds = m.append_assistant_turn("s1", "hi there");
        assert_eq!(rounds, 1);

        let history = m.snapshot_history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[test]
    fn test_reset_preserves_slot() {
        let m = manager(10, 3600);
        m.append_user_turn("s1", "hello");
        m.append_assistant_turn("s1", "hi");
        m.reset("s1");

        assert_eq!(m.round_count("s1"), 0);
        assert!(m.snapshot_history("s1").is_empty());
        assert_eq!(m.session_count(), 1);
    }

    #[test]
    fn test_lru_bound_holds_under_many_touches() {
        let m = manager(3, 3600);
        for i in 0..10 {
            m.append_user_turn(&format!("s{i}"), "hello");
            assert!(m.session_count() <= 3);
        }
    }

    #[test]
    fn test_oldest_touched_is_evicted_first() {
        let m = manager(2, 3600);
        m.append_user_turn("old", "a");
        std::thread::sleep(std::time::Duration::from_millis(5));
        m.append_user_turn("mid", "b");
        std::thread::sleep(std::time::Duration::from_millis(5));
        m.append_user_turn("new", "c");

        assert_eq!(m.session_count(), 2);
        // "mid" survived the eviction; "old" was the victim, so a fresh
        // slot for it has no history.
        assert_eq!(m.snapshot_history("mid").len(), 1);
        assert!(m.snapshot_history("old").is_empty());
    }

    #[test]
    fn test_ttl_eviction() {
        let m = manager(10, 60);
        {
            let mut sessions = m.lock();
            sessions.insert(
                "stale".to_string(),
                SessionState {
                    history: vec![ChatTurn {
                        role: Role::User,
                        content: "old".to_string(),
                    }],
                    round_count: 3,
                    last_touched: now_ts() - 120.0,
                },
            );
        }
        // Any access cleans up the expired slot.
        m.append_user_turn("fresh", "hi");
        assert!(m.snapshot_history("stale").is_empty());
    }

    #[test]
    fn test_concurrent_touches_stay_bounded() {
        use std::sync::Arc;
        let m = Arc::new(manager(5, 3600));
        let mut handles = Vec::new();
        for t in 0..4 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    m.append_user_turn(&format!("s{t}-{i}"), "x");
                    m.append_assistant_turn(&format!("s{t}-{i}"), "y");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        m.append_user_turn("final", "x");
        assert!(m.session_count() <= 6);
    }
}
