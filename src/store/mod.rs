//! Relational store seam.
//!
//! Handlers borrow one [`StoreTransaction`] per task. The router owns its
//! lifecycle: commit on success, rollback on any failure.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The columns of a ticket row the worker reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub state: String,
}

/// One row returned by the overdue-tickets procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueTicket {
    pub ticket_id: String,
    pub days_open: i64,
    pub current_state: String,
}

/// Ticket count per state.
pub type StateCounts = BTreeMap<String, i64>;

/// Opens transactions against the relational store.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Start a transaction.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// Queries available to task handlers inside one transaction.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read a ticket by id.
    async fn find_ticket(&mut self, id: &str) -> StoreResult<Option<Ticket>>;

    /// Run the server-side overdue procedure.
    async fn process_overdue(&mut self) -> StoreResult<Vec<OverdueTicket>>;

    /// Count tickets created on `date`, grouped by state.
    async fn count_by_state(&mut self, date: NaiveDate) -> StoreResult<StateCounts>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// A type-erased store that can be shared across tasks.
pub type SharedStore = Arc<dyn TicketStore>;
