//! In-memory [`OutcomeStore`] for coordinator tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{AccountId, OutcomeEntry, OutcomeLog, ReplicationPolicy};

use super::OutcomeStore;

#[derive(Default)]
pub struct MemoryStore {
    policy: Mutex<Option<ReplicationPolicy>>,
    sessions: Mutex<HashMap<Uuid, bool>>,
    log: Mutex<Vec<OutcomeEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session is recorded and, if so, whether it has ended.
    pub fn session_ended(&self, session_id: Uuid) -> Option<bool> {
        self.sessions.lock().unwrap().get(&session_id).copied()
    }
}

#[async_trait]
impl OutcomeStore for MemoryStore {
    async fn load_policy(&self) -> Result<Option<ReplicationPolicy>> {
        Ok(self.policy.lock().unwrap().clone())
    }

    async fn save_policy(&self, policy: &ReplicationPolicy) -> Result<()> {
        *self.policy.lock().unwrap() = Some(policy.clone());
        Ok(())
    }

    async fn begin_session(&self, session_id: Uuid, _followers: &[AccountId]) -> Result<()> {
        self.sessions.lock().unwrap().insert(session_id, false);
        Ok(())
    }

    async fn end_session(&self, session_id: Uuid) -> Result<()> {
        self.sessions.lock().unwrap().insert(session_id, true);
        Ok(())
    }

    async fn append_outcome(&self, entry: &OutcomeEntry) -> Result<()> {
        self.log.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn load_outcomes(&self, session_id: Uuid) -> Result<Vec<OutcomeEntry>> {
        let rows: Vec<OutcomeEntry> = self
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        Ok(OutcomeLog::from_entries(rows).into_entries())
    }
}
