use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// The session was already mapped; the stored sandbox id is unchanged.
    AlreadyExists { sandbox_id: String },
}

/// Maps agent session ids to the sandbox that hosts them.
///
/// Entries live for the lifetime of the process. A mapping is never
/// overwritten, so a resumed session cannot be redirected to another sandbox.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, session_id: &str) -> Option<String> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn record(&self, session_id: &str, sandbox_id: &str) -> RecordOutcome {
        let mut sessions = self.sessions.write().await;
        match sessions.entry(session_id.to_string()) {
            Entry::Occupied(existing) => {
                tracing::warn!(
                    session_id = %session_id,
                    sandbox_id = %existing.get(),
                    rejected_sandbox_id = %sandbox_id,
                    "session already mapped; keeping existing sandbox"
                );
                RecordOutcome::AlreadyExists {
                    sandbox_id: existing.get().clone(),
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(sandbox_id.to_string());
                tracing::info!(session_id = %session_id, sandbox_id = %sandbox_id, "session recorded");
                RecordOutcome::Recorded
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
