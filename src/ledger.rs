//! Processed/failed ledgers.
//!
//! Two append-only lists. Every entry popped from the main queue ends up in
//! exactly one of them. The failed ledger doubles as the dead-letter store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::{Broker, BrokerResult, SharedBroker};
use crate::envelope::TaskEnvelope;
use crate::error::{DecodeError, HandlerError};
use crate::queues::QueueNames;

/// Outcome marker carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// `{task, processed_at, outcome: "success"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub task: TaskEnvelope,
    pub processed_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl ProcessedRecord {
    pub fn new(task: TaskEnvelope) -> Self {
        Self {
            task,
            processed_at: Utc::now(),
            outcome: Outcome::Success,
        }
    }
}

/// The task part of a failed record.
///
/// Serialized either as the envelope itself or as `{"raw": "..."}` when the
/// payload never decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailedTask {
    Envelope(TaskEnvelope),
    Raw { raw: String },
}

/// `{task, error, processed_at, outcome: "failure"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub task: FailedTask,
    pub error: String,
    pub processed_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl FailedRecord {
    pub fn new(task: FailedTask, error: impl Into<String>) -> Self {
        Self {
            task,
            error: error.into(),
            processed_at: Utc::now(),
            outcome: Outcome::Failure,
        }
    }

    /// Record for a payload that did not decode. Keeps the raw text.
    pub fn from_decode(err: &DecodeError) -> Self {
        Self::new(
            FailedTask::Raw {
                raw: err.raw.clone(),
            },
            err.to_string(),
        )
    }

    /// Record for a handler failure. Keeps the decoded envelope.
    pub fn from_handler(err: &HandlerError) -> Self {
        Self::new(FailedTask::Envelope(err.task.clone()), err.to_string())
    }
}

/// Which ledger list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Processed,
    Failed,
}

/// Queue depths as seen by an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Appends records and serves operator reads.
#[derive(Clone)]
pub struct Ledger {
    broker: SharedBroker,
    queues: QueueNames,
}

impl Ledger {
    pub fn new(broker: SharedBroker, queues: QueueNames) -> Self {
        Self { broker, queues }
    }

    fn key(&self, kind: LedgerKind) -> &str {
        match kind {
            LedgerKind::Processed => self.queues.processed(),
            LedgerKind::Failed => self.queues.failed(),
        }
    }

    /// Append to the processed ledger. Returns its new length.
    pub async fn record_processed(&self, record: &ProcessedRecord) -> BrokerResult<u64> {
        let json = serde_json::to_string(record)?;
        self.broker
            .push(self.queues.processed(), &[json])
            .await
    }

    /// Append to the failed ledger. Returns its new length.
    pub async fn record_failed(&self, record: &FailedRecord) -> BrokerResult<u64> {
        let json = serde_json::to_string(record)?;
        self.broker.push(self.queues.failed(), &[json]).await
    }

    /// Lengths of the main queue and both ledgers.
    pub async fn counts(&self) -> BrokerResult<LedgerCounts> {
        Ok(LedgerCounts {
            pending: self.broker.len(self.queues.main()).await?,
            processed: self.broker.len(self.queues.processed()).await?,
            failed: self.broker.len(self.queues.failed()).await?,
        })
    }

    /// The last `n` entries of a ledger, oldest first.
    ///
    /// Entries come back normalized, so records written by other producers in
    /// a different shape are still returned.
    pub async fn recent(&self, kind: LedgerKind, n: usize) -> BrokerResult<Vec<Value>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let start = -(n.min(i64::MAX as usize) as i64);
        self.broker.range(self.key(kind), start, -1).await
    }

    pub async fn recent_processed(&self, n: usize) -> BrokerResult<Vec<Value>> {
        self.recent(LedgerKind::Processed, n).await
    }

    pub async fn recent_failed(&self, n: usize) -> BrokerResult<Vec<Value>> {
        self.recent(LedgerKind::Failed, n).await
    }

    /// Drop a whole ledger list. Returns whether it existed.
    pub async fn clear(&self, kind: LedgerKind) -> BrokerResult<bool> {
        let key = self.key(kind).to_string();
        let removed = self.broker.delete(&[key.clone()]).await?;
        tracing::info!(queue = %key, "Ledger cleared");
        Ok(removed > 0)
    }
}
