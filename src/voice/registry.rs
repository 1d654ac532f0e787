//! Map from session id to the one live orchestrator for it.
//!
//! This is the only structure shared across connections. Every operation
//! touches a single key under a short synchronous lock that is never held
//! across an await.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::orchestrator::AgentOrchestrator;
use crate::error::RejectReason;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<AgentOrchestrator>>>,
    /// 0 = unlimited.
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Pre-upgrade admission check. The authoritative check is [`insert`].
    ///
    /// [`insert`]: Self::insert
    pub fn can_admit(&self, session_id: &str) -> Result<(), RejectReason> {
        let sessions = self.sessions.lock();
        Self::admit(&sessions, session_id, self.max_sessions)
    }

    /// Register the orchestrator for `session_id`. Fails if the id already
    /// has a live orchestrator or the registry is full.
    pub fn insert(
        &self,
        session_id: &str,
        orchestrator: Arc<AgentOrchestrator>,
    ) -> Result<(), RejectReason> {
        let mut sessions = self.sessions.lock();
        Self::admit(&sessions, session_id, self.max_sessions)?;
        sessions.insert(session_id.to_string(), orchestrator);
        tracing::debug!(session_id, active = sessions.len(), "Session registered");
        Ok(())
    }

    fn admit(
        sessions: &HashMap<String, Arc<AgentOrchestrator>>,
        session_id: &str,
        max_sessions: usize,
    ) -> Result<(), RejectReason> {
        if sessions.contains_key(session_id) {
            return Err(RejectReason::SessionActive);
        }
        if max_sessions > 0 && sessions.len() >= max_sessions {
            return Err(RejectReason::AtCapacity);
        }
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<AgentOrchestrator>> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Remove `session_id` only if it still maps to `orchestrator`.
    pub fn release(&self, session_id: &str, orchestrator: &Arc<AgentOrchestrator>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session_id) {
            Some(current) if Arc::ptr_eq(current, orchestrator) => {
                sessions.remove(session_id);
                tracing::debug!(session_id, active = sessions.len(), "Session released");
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<AgentOrchestrator>> {
        self.sessions.lock().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Drain every session and clean it up. Used on gateway shutdown.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        let count = drained.len();
        for (session_id, orchestrator) in drained {
            tracing::info!(session_id = %session_id, "Closing session for shutdown");
            orchestrator.cleanup().await;
        }
        count
    }
}
