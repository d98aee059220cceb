//! In-memory store for tests and dry runs.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{OverdueTicket, StateCounts, StoreResult, StoreTransaction, Ticket, TicketStore};
use crate::error::StoreError;

#[derive(Default)]
struct Counters {
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

/// Store backed by plain collections.
///
/// Reads are served straight from the shared data; transactions only count
/// begin/commit/rollback so tests can check the router's bookkeeping.
#[derive(Clone, Default)]
pub struct MemoryTicketStore {
    tickets: Arc<Mutex<Vec<(Ticket, NaiveDate)>>>,
    overdue: Arc<Mutex<Vec<OverdueTicket>>>,
    counters: Arc<Counters>,
    failing: Arc<AtomicBool>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a ticket created on `created_on`.
    pub fn insert_ticket(&self, ticket: Ticket, created_on: NaiveDate) {
        lock(&self.tickets).push((ticket, created_on));
    }

    /// Rows the overdue procedure will return.
    pub fn set_overdue(&self, rows: Vec<OverdueTicket>) {
        *lock(&self.overdue) = rows;
    }

    /// Make every query fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn begun(&self) -> usize {
        self.counters.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> usize {
        self.counters.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.counters.rolled_back.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
        }))
    }
}

struct MemoryTransaction {
    store: MemoryTicketStore,
}

impl MemoryTransaction {
    fn check(&self) -> StoreResult<()> {
        if self.store.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected store failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find_ticket(&mut self, id: &str) -> StoreResult<Option<Ticket>> {
        self.check()?;
        Ok(lock(&self.store.tickets)
            .iter()
            .find(|(ticket, _)| ticket.id == id)
            .map(|(ticket, _)| ticket.clone()))
    }

    async fn process_overdue(&mut self) -> StoreResult<Vec<OverdueTicket>> {
        self.check()?;
        Ok(lock(&self.store.overdue).clone())
    }

    async fn count_by_state(&mut self, date: NaiveDate) -> StoreResult<StateCounts> {
        self.check()?;
        let mut counts = StateCounts::new();
        for (ticket, created_on) in lock(&self.store.tickets).iter() {
            if *created_on == date {
                *counts.entry(ticket.state.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.store.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.store.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
