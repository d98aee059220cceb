//! # ticket-dispatch
//!
//! Queue-backed task dispatch for the support-ticket platform.
//!
//! Producers push JSON task envelopes onto a main queue. A single-consumer
//! [`Worker`] pops them, routes each to a handler that runs inside one store
//! transaction, and appends the outcome to a processed or failed ledger.
//!
//! ## Features
//!
//! - **Two broker substrates**: native Redis (server-side blocking pop) or a
//!   REST endpoint (polled pop), selected once from configuration
//! - **Ledgers**: every popped entry yields exactly one processed or failed
//!   record; the failed ledger is the dead-letter store
//! - **Contained failures**: bad tasks never stop the loop; broker errors back
//!   off and retry
//! - **Graceful shutdown**: an entry that was popped is always finished
//!
//! ## Quick Start
//!
//! ### Producer
//!
//! ```rust,no_run
//! use ticket_dispatch::{broker, Producer, TaskEnvelope, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::from_env()?;
//!     let broker = broker::connect(&config.broker, config.poll_interval).await?;
//!     let producer = Producer::new(broker, config.queues.clone());
//!
//!     let task = TaskEnvelope::new("notify_ticket_created").with_field("ticket_id", "T1");
//!     producer.enqueue(&task).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Worker
//!
//! ```rust,no_run
//! use ticket_dispatch::{DatabaseConfig, Worker, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let worker = Worker::connect(WorkerConfig::from_env()?, &DatabaseConfig::from_env()?).await?;
//!     let shutdown = worker.shutdown_handle();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         shutdown.cancel();
//!     });
//!     worker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod ledger;
pub mod producer;
pub mod queues;
pub mod router;
pub mod store;
pub mod worker;

// Re-export main types
pub use broker::{Broker, Popped, SharedBroker};
pub use config::{BrokerConfig, DatabaseConfig, WorkerConfig, WorkerConfigBuilder};
pub use envelope::{decode_payload, TaskEnvelope, TaskKind};
pub use error::{
    BrokerError, ConfigError, DecodeError, HandlerError, HandlerFailure, Result, StoreError,
    WorkerError,
};
pub use events::NotificationEvent;
pub use ledger::{FailedRecord, FailedTask, Ledger, LedgerCounts, LedgerKind, ProcessedRecord};
pub use producer::Producer;
pub use queues::QueueNames;
pub use router::{Dispatch, Router, TaskOutput};
pub use store::{SharedStore, StoreTransaction, TicketStore};
pub use worker::{Disposition, ShutdownHandle, Worker, WorkerState};
