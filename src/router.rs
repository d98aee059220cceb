//! Task routing: kind → handler, one store transaction per task.

use chrono::{NaiveDate, Utc};
use serde_json::Value;

use crate::broker::{Broker, SharedBroker};
use crate::envelope::{TaskEnvelope, TaskKind};
use crate::error::{HandlerError, HandlerFailure};
use crate::events::{NotificationEvent, OVERDUE_TICKETS_PROCESSED};
use crate::store::{OverdueTicket, StateCounts, StoreTransaction, Ticket, TicketStore};

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// `notify_ticket_created`. `None` when the ticket does not exist.
    Notified { ticket: Option<Ticket> },
    /// `process_overdue_tickets`.
    OverdueProcessed(Vec<OverdueTicket>),
    /// `generate_report`.
    Report { date: NaiveDate, counts: StateCounts },
    /// `clear_cache`. `removed` is what the broker reported.
    CacheCleared { removed: u64 },
}

/// How the router disposed of an envelope it did not fail on.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Handled(TaskOutput),
    /// Unknown kind. Deliberately a success with no side effects.
    Ignored { kind: String },
}

/// Maps task kinds to handlers.
#[derive(Clone)]
pub struct Router {
    broker: SharedBroker,
    events_channel: String,
}

impl Router {
    /// Create a router that publishes events on `events_channel`.
    pub fn new(broker: SharedBroker, events_channel: impl Into<String>) -> Self {
        Self {
            broker,
            events_channel: events_channel.into(),
        }
    }

    /// Run the handler for `envelope` inside a fresh transaction.
    ///
    /// The transaction is committed when the handler succeeds and rolled back
    /// otherwise. Unknown kinds never open a transaction.
    pub async fn route(
        &self,
        envelope: &TaskEnvelope,
        store: &dyn TicketStore,
    ) -> Result<Dispatch, HandlerError> {
        let kind = match envelope.task_kind() {
            Some(kind) => kind,
            None => {
                tracing::warn!(kind = %envelope.kind, "Unknown task kind, ignoring");
                return Ok(Dispatch::Ignored {
                    kind: envelope.kind.clone(),
                });
            }
        };

        tracing::info!(kind = %kind, "Processing task");
        let mut tx = store
            .begin()
            .await
            .map_err(|e| HandlerError::new(envelope, e))?;

        match self.dispatch(kind, envelope, tx.as_mut()).await {
            Ok(output) => {
                tx.commit()
                    .await
                    .map_err(|e| HandlerError::new(envelope, e))?;
                Ok(Dispatch::Handled(output))
            }
            Err(failure) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(kind = %kind, error = %e, "Rollback failed");
                }
                Err(HandlerError::new(envelope, failure))
            }
        }
    }

    async fn dispatch(
        &self,
        kind: TaskKind,
        envelope: &TaskEnvelope,
        tx: &mut dyn StoreTransaction,
    ) -> Result<TaskOutput, HandlerFailure> {
        match kind {
            TaskKind::NotifyTicketCreated => self.notify_ticket_created(envelope, tx).await,
            TaskKind::ProcessOverdueTickets => self.process_overdue_tickets(tx).await,
            TaskKind::GenerateReport => self.generate_report(envelope, tx).await,
            TaskKind::ClearCache => self.clear_cache(envelope).await,
        }
    }

    async fn notify_ticket_created(
        &self,
        envelope: &TaskEnvelope,
        tx: &mut dyn StoreTransaction,
    ) -> Result<TaskOutput, HandlerFailure> {
        let ticket_id = envelope
            .field_text("ticket_id")
            .ok_or_else(|| HandlerFailure::MissingField("ticket_id".to_string()))?;

        let ticket = tx.find_ticket(&ticket_id).await?;
        match &ticket {
            Some(ticket) => tracing::info!(
                ticket_id = %ticket.id,
                title = %ticket.title,
                state = %ticket.state,
                "Ticket creation processed"
            ),
            // Producers can race ticket deletion; not worth failing the task.
            None => tracing::warn!(ticket_id = %ticket_id, "Ticket not found"),
        }
        Ok(TaskOutput::Notified { ticket })
    }

    async fn process_overdue_tickets(
        &self,
        tx: &mut dyn StoreTransaction,
    ) -> Result<TaskOutput, HandlerFailure> {
        let overdue = tx.process_overdue().await?;
        tracing::info!(count = overdue.len(), "Overdue tickets processed");

        NotificationEvent::new(OVERDUE_TICKETS_PROCESSED)
            .with_field("count", overdue.len())
            .publish(&self.broker, &self.events_channel)
            .await?;

        Ok(TaskOutput::OverdueProcessed(overdue))
    }

    async fn generate_report(
        &self,
        envelope: &TaskEnvelope,
        tx: &mut dyn StoreTransaction,
    ) -> Result<TaskOutput, HandlerFailure> {
        let date = match envelope.field("date") {
            None | Some(Value::Null) => Utc::now().date_naive(),
            Some(Value::String(text)) => NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(
                |e| HandlerFailure::InvalidField {
                    field: "date".to_string(),
                    reason: e.to_string(),
                },
            )?,
            Some(other) => {
                return Err(HandlerFailure::InvalidField {
                    field: "date".to_string(),
                    reason: format!("expected YYYY-MM-DD, got {}", other),
                })
            }
        };

        let counts = tx.count_by_state(date).await?;
        tracing::info!(date = %date, counts = ?counts, "Report generated");
        Ok(TaskOutput::Report { date, counts })
    }

    async fn clear_cache(&self, envelope: &TaskEnvelope) -> Result<TaskOutput, HandlerFailure> {
        let keys = cache_keys(envelope)?;
        if keys.is_empty() {
            // Pattern deletion needs key scanning, which the REST substrate
            // lacks, so neither substrate does it.
            tracing::warn!(
                pattern = ?envelope.field_text("pattern"),
                "No explicit cache keys supplied, nothing deleted"
            );
            return Ok(TaskOutput::CacheCleared { removed: 0 });
        }

        let removed = self.broker.delete(&keys).await?;
        tracing::info!(requested = keys.len(), removed, "Cache keys deleted");
        Ok(TaskOutput::CacheCleared { removed })
    }
}

fn cache_keys(envelope: &TaskEnvelope) -> Result<Vec<String>, HandlerFailure> {
    let invalid = |reason: String| HandlerFailure::InvalidField {
        field: "keys".to_string(),
        reason,
    };

    match envelope.field("keys") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(key)) => Ok(vec![key.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(key) => Ok(key.clone()),
                other => Err(invalid(format!("expected a string key, got {}", other))),
            })
            .collect(),
        Some(other) => Err(invalid(format!("expected a list of keys, got {}", other))),
    }
}
