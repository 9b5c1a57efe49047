use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Duration;

use crate::store::{get_record, put_record, SharedStore, StoreResult};

use super::models::{SessionStatus, StreamJob, StreamSession};

const JOB_PREFIX: &str = "stream_job:";
const SESSION_PREFIX: &str = "stream_session:";
const ACTIVE_SESSION_PREFIX: &str = "stream_active_session:";
/// Finished sessions stay readable for audit this long.
const TERMINAL_SESSION_RETENTION_HOURS: i64 = 24;

/// Stream jobs and sessions persisted in the shared store.
#[derive(Clone)]
pub struct LifecycleRepository {
    store: Arc<dyn SharedStore>,
}

impl fmt::Debug for LifecycleRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleRepository").finish_non_exhaustive()
    }
}

impl LifecycleRepository {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn save_job(&self, job: &StreamJob) -> StoreResult<()> {
        put_record(
            self.store.as_ref(),
            &format!("{JOB_PREFIX}{}", job.id),
            job,
            None,
        )
    }

    pub fn job(&self, id: &str) -> StoreResult<Option<StreamJob>> {
        get_record(self.store.as_ref(), &format!("{JOB_PREFIX}{id}"))
    }

    pub fn jobs(&self) -> StoreResult<Vec<StreamJob>> {
        let mut jobs = Vec::new();
        for key in self.store.keys(JOB_PREFIX)? {
            if let Some(job) = get_record::<StreamJob>(self.store.as_ref(), &key)? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    pub fn save_session(&self, session: &StreamSession) -> StoreResult<()> {
        let ttl = session
            .status
            .is_terminal()
            .then(|| Duration::hours(TERMINAL_SESSION_RETENTION_HOURS));
        put_record(
            self.store.as_ref(),
            &format!("{SESSION_PREFIX}{}", session.id),
            session,
            ttl,
        )
    }

    pub fn session(&self, id: &str) -> StoreResult<Option<StreamSession>> {
        get_record(self.store.as_ref(), &format!("{SESSION_PREFIX}{id}"))
    }

    pub fn sessions(&self) -> StoreResult<Vec<StreamSession>> {
        let mut sessions = Vec::new();
        for key in self.store.keys(SESSION_PREFIX)? {
            if let Some(session) = get_record::<StreamSession>(self.store.as_ref(), &key)? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Sessions in ACTIVE state, optionally restricted to one node.
    pub fn active_sessions(&self, node_id: Option<&str>) -> StoreResult<Vec<StreamSession>> {
        Ok(self
            .sessions()?
            .into_iter()
            .filter(|session| session.status == SessionStatus::Active)
            .filter(|session| node_id.map_or(true, |id| session.node_id == id))
            .collect())
    }

    pub fn active_counts_by_node(&self) -> StoreResult<HashMap<String, i64>> {
        let mut counts = HashMap::new();
        for session in self.active_sessions(None)? {
            *counts.entry(session.node_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn active_session_id(&self, job_id: &str) -> StoreResult<Option<String>> {
        self.store.get(&format!("{ACTIVE_SESSION_PREFIX}{job_id}"))
    }

    pub fn active_session(&self, job_id: &str) -> StoreResult<Option<StreamSession>> {
        let Some(session_id) = self.active_session_id(job_id)? else {
            return Ok(None);
        };
        Ok(self
            .session(&session_id)?
            .filter(|session| session.status == SessionStatus::Active))
    }

    pub fn set_active_session(&self, job_id: &str, session_id: &str) -> StoreResult<()> {
        self.store
            .set(&format!("{ACTIVE_SESSION_PREFIX}{job_id}"), session_id, None)
    }

    /// Clears the pointer only if it still names `session_id`.
    pub fn clear_active_session(&self, job_id: &str, session_id: &str) -> StoreResult<bool> {
        if self.active_session_id(job_id)?.as_deref() == Some(session_id) {
            return self
                .store
                .delete(&format!("{ACTIVE_SESSION_PREFIX}{job_id}"));
        }
        Ok(false)
    }
}
