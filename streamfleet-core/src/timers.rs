//! Deadlines persisted in the shared store.
//!
//! Follow-up checks (handover verification, update completion) are sorted-set
//! members scored by due time. Whoever removes a member first owns it, so
//! concurrent supervisors never run the same timer twice.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{decode_record, encode_record};
use crate::store::{SharedStore, StoreError, StoreResult};

const TIMER_KEY: &str = "fleet:timers";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerKind {
    HandoverCheck { node_id: String },
    UpdateCompletionCheck { node_id: String, version: String },
}

impl TimerKind {
    pub fn node_id(&self) -> &str {
        match self {
            TimerKind::HandoverCheck { node_id } => node_id,
            TimerKind::UpdateCompletionCheck { node_id, .. } => node_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub id: String,
    pub kind: TimerKind,
    pub due_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TimerQueue {
    store: Arc<dyn SharedStore>,
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue").finish_non_exhaustive()
    }
}

impl TimerQueue {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn schedule(&self, kind: TimerKind, due_at: DateTime<Utc>) -> StoreResult<Timer> {
        let timer = Timer {
            id: Uuid::new_v4().to_string(),
            kind,
            due_at,
        };
        self.store.zadd(
            TIMER_KEY,
            &encode_record(&timer)?,
            due_at.timestamp_millis() as f64,
        )?;
        Ok(timer)
    }

    /// Removes and returns every timer due at or before `now`, earliest first.
    pub fn claim_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Timer>> {
        let mut claimed = Vec::new();
        for (member, _) in self
            .store
            .zrange_by_score(TIMER_KEY, now.timestamp_millis() as f64)?
        {
            if self.store.zrem(TIMER_KEY, &member)? {
                claimed.push(decode_record(&member).map_err(StoreError::from)?);
            }
        }
        Ok(claimed)
    }

    pub fn pending(&self) -> StoreResult<Vec<Timer>> {
        self.store
            .zrange_by_score(TIMER_KEY, f64::MAX)?
            .into_iter()
            .map(|(member, _)| decode_record(&member).map_err(StoreError::from))
            .collect()
    }

    /// Drops every pending timer for `node_id`.
    pub fn cancel_for_node(&self, node_id: &str) -> StoreResult<usize> {
        let mut removed = 0;
        for (member, _) in self.store.zrange_by_score(TIMER_KEY, f64::MAX)? {
            let timer: Timer = decode_record(&member)?;
            if timer.kind.node_id() == node_id && self.store.zrem(TIMER_KEY, &member)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
