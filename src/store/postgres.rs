//! PostgreSQL store.
//!
//! Expects a `tickets(id, title, state, created_at, ...)` table and a
//! set-returning `process_overdue_tickets()` function yielding
//! `(ticket_id, days_open, current_state)`.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use super::{OverdueTicket, StateCounts, StoreResult, StoreTransaction, Ticket, TicketStore};
use crate::config::DatabaseConfig;

/// PostgreSQL-backed ticket store.
#[derive(Clone)]
pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    /// Connect a pool sized by `config`.
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .test_before_acquire(true)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn find_ticket(&mut self, id: &str) -> StoreResult<Option<Ticket>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT id::text, title, state FROM tickets WHERE id::text = $1")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row.map(|(id, title, state)| Ticket { id, title, state }))
    }

    async fn process_overdue(&mut self) -> StoreResult<Vec<OverdueTicket>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT ticket_id::text, days_open::bigint, current_state::text \
             FROM process_overdue_tickets()",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(ticket_id, days_open, current_state)| OverdueTicket {
                ticket_id,
                days_open,
                current_state,
            })
            .collect())
    }

    async fn count_by_state(&mut self, date: NaiveDate) -> StoreResult<StateCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state::text, COUNT(*)::bigint FROM tickets \
             WHERE DATE(created_at) = $1 GROUP BY state",
        )
        .bind(date)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
