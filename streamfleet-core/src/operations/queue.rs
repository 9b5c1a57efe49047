use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::codec::{decode_record, encode_record};
use crate::config::OperationsSection;
use crate::store::{SharedStore, StoreError};

use super::models::{
    backoff_delay_seconds, Operation, OperationKind, OperationStatus, QueueStatus,
};

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<crate::codec::CodecError> for OperationError {
    fn from(err: crate::codec::CodecError) -> Self {
        OperationError::Store(StoreError::Codec(err))
    }
}

pub type OperationResult<T> = Result<T, OperationError>;

fn queue_key(job_id: &str) -> String {
    format!("stream_ops:{job_id}:queue")
}

fn processing_key(job_id: &str) -> String {
    format!("stream_ops:{job_id}:processing")
}

fn history_key(job_id: &str) -> String {
    format!("stream_ops:{job_id}:history")
}

/// Per-job priority queue admitting at most one in-flight lifecycle
/// operation. Queued operations are sorted-set members scored by priority.
#[derive(Clone)]
pub struct StreamOperationQueue {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: OperationsSection,
}

impl fmt::Debug for StreamOperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOperationQueue")
            .field("config", &self.config)
            .finish()
    }
}

impl StreamOperationQueue {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, config: OperationsSection) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Admits an operation unless a conflicting kind is queued or
    /// processing for the job. A rejection is `Ok(false)`.
    pub fn queue_operation(
        &self,
        job_id: &str,
        kind: OperationKind,
        payload: Value,
    ) -> OperationResult<bool> {
        if let Some(existing) = self.has_conflicting_operation(job_id, kind)? {
            warn!(
                job_id = %job_id,
                requested = %kind,
                existing = %existing.kind,
                existing_status = ?existing.status,
                "operation rejected: conflicting operation in flight"
            );
            return Ok(false);
        }
        let operation = Operation {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            kind,
            priority: kind.base_priority(),
            retry_count: 0,
            status: OperationStatus::Queued,
            payload,
            created_at: self.clock.now(),
            not_before: None,
            last_error: None,
            finished_at: None,
        };
        self.enqueue(&operation)?;
        info!(
            job_id = %job_id,
            operation_id = %operation.id,
            kind = %kind,
            priority = operation.priority,
            "operation queued"
        );
        Ok(true)
    }

    /// Returns the first queued or processing operation whose kind conflicts
    /// with `kind`.
    pub fn has_conflicting_operation(
        &self,
        job_id: &str,
        kind: OperationKind,
    ) -> OperationResult<Option<Operation>> {
        let conflicts = kind.conflicts_with();
        if conflicts.is_empty() {
            return Ok(None);
        }
        if let Some(processing) = self.processing(job_id)? {
            if conflicts.contains(&processing.kind) {
                return Ok(Some(processing));
            }
        }
        Ok(self
            .queued(job_id)?
            .into_iter()
            .map(|(operation, _)| operation)
            .find(|operation| conflicts.contains(&operation.kind)))
    }

    /// Pops the highest-priority queued operation and marks it processing.
    /// Returns `None` when the queue is empty, another operation is still
    /// processing, or the head of the queue is waiting out its backoff.
    pub fn process_next(&self, job_id: &str) -> OperationResult<Option<Operation>> {
        if self.store.exists(&processing_key(job_id))? {
            debug!(job_id = %job_id, "operation already processing");
            return Ok(None);
        }
        let Some((mut operation, member)) = self.queued(job_id)?.into_iter().next() else {
            return Ok(None);
        };
        let now = self.clock.now();
        if !operation.is_due(now) {
            debug!(job_id = %job_id, operation_id = %operation.id, "head operation in backoff");
            return Ok(None);
        }
        if !self.store.zrem(&queue_key(job_id), &member)? {
            // Another worker popped it first.
            return Ok(None);
        }
        operation.status = OperationStatus::Processing;
        let claimed = self.store.set_nx(
            &processing_key(job_id),
            &encode_record(&operation)?,
            Some(Duration::seconds(self.config.processing_ttl_seconds)),
        )?;
        if !claimed {
            operation.status = OperationStatus::Queued;
            self.enqueue(&operation)?;
            return Ok(None);
        }
        info!(
            job_id = %job_id,
            operation_id = %operation.id,
            kind = %operation.kind,
            retry_count = operation.retry_count,
            "operation processing"
        );
        Ok(Some(operation))
    }

    pub fn mark_completed(
        &self,
        job_id: &str,
        operation_id: &str,
        success: bool,
    ) -> OperationResult<()> {
        let Some(operation) = self.take_processing(job_id, operation_id)? else {
            return Ok(());
        };
        self.archive(operation, success)
    }

    /// Records a failed attempt. Returns `true` when the operation was
    /// re-queued with backoff and `false` once retries are exhausted.
    pub fn mark_failed(
        &self,
        job_id: &str,
        operation_id: &str,
        error: &str,
    ) -> OperationResult<bool> {
        let Some(mut operation) = self.take_processing(job_id, operation_id)? else {
            return Ok(false);
        };
        operation.retry_count += 1;
        operation.last_error = Some(error.to_string());
        if operation.retry_count >= self.config.max_retries {
            warn!(
                job_id = %job_id,
                operation_id = %operation.id,
                kind = %operation.kind,
                retries = operation.retry_count,
                error,
                "operation permanently failed"
            );
            self.archive(operation, false)?;
            return Ok(false);
        }
        let delay = backoff_delay_seconds(
            operation.retry_count,
            self.config.backoff_base_seconds,
            self.config.backoff_cap_seconds,
        );
        operation.priority = operation.kind.base_priority() - operation.retry_count as i64;
        operation.status = OperationStatus::Queued;
        operation.not_before = Some(self.clock.now() + Duration::seconds(delay));
        self.enqueue(&operation)?;
        info!(
            job_id = %job_id,
            operation_id = %operation.id,
            retry_count = operation.retry_count,
            delay_seconds = delay,
            priority = operation.priority,
            "operation re-queued after failure"
        );
        Ok(true)
    }

    pub fn get_status(&self, job_id: &str) -> OperationResult<QueueStatus> {
        let history = self
            .store
            .lrange(&history_key(job_id), self.config.history_limit)?
            .iter()
            .map(|raw| decode_record(raw))
            .collect::<Result<Vec<Operation>, _>>()?;
        Ok(QueueStatus {
            job_id: job_id.to_string(),
            processing: self.processing(job_id)?,
            queued: self
                .queued(job_id)?
                .into_iter()
                .map(|(operation, _)| operation)
                .collect(),
            history,
        })
    }

    /// Drops queued and processing operations. History is kept.
    pub fn clear_operations(&self, job_id: &str) -> OperationResult<usize> {
        let queued = self.store.zcard(&queue_key(job_id))?;
        self.store.delete(&queue_key(job_id))?;
        let processing = self.store.delete(&processing_key(job_id))?;
        info!(job_id = %job_id, queued, processing, "operations cleared");
        Ok(queued + usize::from(processing))
    }

    fn enqueue(&self, operation: &Operation) -> OperationResult<()> {
        let key = queue_key(&operation.job_id);
        self.store
            .zadd(&key, &encode_record(operation)?, operation.priority as f64)?;
        self.store
            .expire(&key, Duration::seconds(self.config.queue_ttl_seconds))?;
        Ok(())
    }

    fn queued(&self, job_id: &str) -> OperationResult<Vec<(Operation, String)>> {
        self.store
            .zrange_desc(&queue_key(job_id))?
            .into_iter()
            .map(|(member, _)| Ok((decode_record::<Operation>(&member)?, member)))
            .collect()
    }

    fn processing(&self, job_id: &str) -> OperationResult<Option<Operation>> {
        match self.store.get(&processing_key(job_id))? {
            Some(raw) => Ok(Some(decode_record(&raw)?)),
            None => Ok(None),
        }
    }

    fn take_processing(
        &self,
        job_id: &str,
        operation_id: &str,
    ) -> OperationResult<Option<Operation>> {
        match self.processing(job_id)? {
            Some(operation) if operation.id == operation_id => {
                self.store.delete(&processing_key(job_id))?;
                Ok(Some(operation))
            }
            Some(other) => {
                warn!(
                    job_id = %job_id,
                    operation_id,
                    processing = %other.id,
                    "operation is not the one processing"
                );
                Ok(None)
            }
            None => {
                warn!(
                    job_id = %job_id,
                    operation_id,
                    "processing marker missing, operation may have expired"
                );
                Ok(None)
            }
        }
    }

    fn archive(&self, mut operation: Operation, success: bool) -> OperationResult<()> {
        operation.status = if success {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        };
        operation.finished_at = Some(self.clock.now());
        let key = history_key(&operation.job_id);
        self.store.lpush(&key, &encode_record(&operation)?)?;
        self.store.ltrim(&key, self.config.history_limit)?;
        self.store
            .expire(&key, Duration::seconds(self.config.history_ttl_seconds))?;
        debug!(
            job_id = %operation.job_id,
            operation_id = %operation.id,
            status = ?operation.status,
            "operation archived"
        );
        Ok(())
    }
}
