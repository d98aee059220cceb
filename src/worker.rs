//! The worker control loop.
//!
//! One sequential consumer: pop an entry from the main queue, route it, record
//! the outcome, repeat. Per-task failures end up in the failed ledger; broker
//! failures in the loop itself are logged and followed by a fixed backoff.
//! Only a failed startup liveness check ends [`Worker::run`] with an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use crate::broker::{Broker, Popped, SharedBroker};
use crate::config::{DatabaseConfig, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::ledger::{FailedRecord, Ledger, ProcessedRecord};
use crate::router::{Dispatch, Router};
use crate::store::postgres::PgTicketStore;
use crate::store::SharedStore;

/// Lifecycle of a worker.
///
/// `Starting -> Running -> Draining -> Stopped`. A failed liveness check goes
/// straight from `Starting` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// How one popped entry was disposed of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// Unknown kind; recorded as processed.
    Ignored,
    Failed(String),
}

/// Requests a graceful stop.
///
/// The loop checks it before each pop. An entry that was already popped is
/// still processed and recorded.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Single-consumer task worker.
pub struct Worker {
    config: WorkerConfig,
    broker: SharedBroker,
    store: SharedStore,
    router: Router,
    ledger: Ledger,
    shutdown: ShutdownHandle,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    /// Create a worker over an existing broker and store.
    pub fn new(config: WorkerConfig, broker: SharedBroker, store: SharedStore) -> Self {
        let router = Router::new(broker.clone(), config.queues.events());
        let ledger = Ledger::new(broker.clone(), config.queues.clone());
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            config,
            broker,
            store,
            router,
            ledger,
            shutdown: ShutdownHandle::new(),
            state,
        }
    }

    /// Connect the configured broker substrate and the PostgreSQL store.
    ///
    /// A broker that cannot be reached here is a startup failure.
    pub async fn connect(config: WorkerConfig, database: &DatabaseConfig) -> Result<Self> {
        let broker = crate::broker::connect(&config.broker, config.poll_interval)
            .await
            .map_err(|e| WorkerError::Startup(format!("broker connection failed: {}", e)))?;
        let store = PgTicketStore::connect(database).await?;
        Ok(Self::new(config, broker, Arc::new(store)))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Run until cancelled.
    ///
    /// Returns [`WorkerError::Startup`] if the broker does not answer the
    /// initial liveness check; every later failure is contained in the loop.
    pub async fn run(&self) -> Result<()> {
        self.set_state(WorkerState::Starting);
        tracing::info!(
            substrate = self.config.broker.substrate(),
            endpoint = %self.config.broker.endpoint(),
            main = %self.config.queues.main(),
            processed = %self.config.queues.processed(),
            failed = %self.config.queues.failed(),
            pop_timeout = ?self.config.pop_timeout,
            "Worker starting"
        );

        let alive = match self.broker.ping().await {
            Ok(alive) => alive,
            Err(e) => {
                self.set_state(WorkerState::Stopped);
                return Err(WorkerError::Startup(format!("broker unreachable: {}", e)));
            }
        };
        if !alive {
            self.set_state(WorkerState::Stopped);
            return Err(WorkerError::Startup(
                "broker did not answer the liveness check".to_string(),
            ));
        }

        self.set_state(WorkerState::Running);
        tracing::info!("Worker running");

        let keys = [self.config.queues.main().to_string()];
        while !self.shutdown.is_cancelled() {
            match self.broker.blocking_pop(&keys, self.config.pop_timeout).await {
                Ok(Some(popped)) => {
                    self.process_entry(popped).await;
                }
                Ok(None) => {
                    tracing::debug!(queue = %keys[0], "No task before pop timeout");
                    // A pop can return at once (zero timeout, or a substrate that
                    // never suspends); let other tasks and the canceller run.
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        backoff = ?self.config.error_backoff,
                        "Worker loop error, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }
            }
        }

        self.set_state(WorkerState::Draining);
        tracing::info!("Shutdown requested, draining");
        self.set_state(WorkerState::Stopped);
        tracing::info!("Worker stopped");
        Ok(())
    }

    /// Decode, route and record one popped entry.
    ///
    /// Always appends exactly one ledger record. A ledger append that fails
    /// is logged; the entry is not pushed back.
    pub async fn process_entry(&self, popped: Popped) -> Disposition {
        let envelope = match popped.decode() {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(queue = %popped.key, error = %err, raw = %err.raw, "Undecodable task");
                self.append_failed(FailedRecord::from_decode(&err)).await;
                return Disposition::Failed(err.to_string());
            }
        };

        tracing::info!(kind = %envelope.kind, "Task received");
        match self.router.route(&envelope, &*self.store).await {
            Ok(dispatch) => {
                self.append_processed(ProcessedRecord::new(envelope)).await;
                match dispatch {
                    Dispatch::Handled(_) => Disposition::Handled,
                    Dispatch::Ignored { .. } => Disposition::Ignored,
                }
            }
            Err(err) => {
                tracing::error!(kind = %err.kind, error = %err, "Task failed");
                self.append_failed(FailedRecord::from_handler(&err)).await;
                Disposition::Failed(err.to_string())
            }
        }
    }

    async fn append_processed(&self, record: ProcessedRecord) {
        match self.ledger.record_processed(&record).await {
            Ok(_) => tracing::info!(kind = %record.task.kind, "Task processed"),
            Err(e) => tracing::error!(
                kind = %record.task.kind,
                error = %e,
                "Failed to append to processed ledger"
            ),
        }
    }

    async fn append_failed(&self, record: FailedRecord) {
        if let Err(e) = self.ledger.record_failed(&record).await {
            tracing::error!(error = %e, "Failed to append to failed ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::envelope::TaskEnvelope;
    use crate::ledger::{FailedRecord, FailedTask, ProcessedRecord};
    use crate::queues::QueueNames;
    use crate::store::memory::MemoryTicketStore;
    use crate::store::Ticket;
    use chrono::NaiveDate;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::Instant;

    const MAIN: &str = "queue:batch:process";
    const PROCESSED: &str = "queue:batch:processed";
    const FAILED: &str = "queue:batch:failed";

    fn worker() -> (MemoryBroker, MemoryTicketStore, Arc<Worker>) {
        let broker = MemoryBroker::new();
        let store = MemoryTicketStore::new();
        let config = WorkerConfig::builder()
            .queues(QueueNames::default())
            .pop_timeout(Duration::from_secs(30))
            .error_backoff(Duration::from_secs(5))
            .build();
        let worker = Worker::new(
            config,
            SharedBroker::new(broker.clone()),
            Arc::new(store.clone()),
        );
        (broker, store, Arc::new(worker))
    }

    fn popped(payload: Value) -> Popped {
        Popped::from_value(MAIN, payload)
    }

    async fn wait_for_len(broker: &MemoryBroker, key: &str, len: usize) {
        while broker.list(key).len() < len {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_existing_ticket_is_processed() {
        let (broker, store, worker) = worker();
        store.insert_ticket(
            Ticket {
                id: "T1".into(),
                title: "Printer on fire".into(),
                state: "open".into(),
            },
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        );

        let payload = json!({"kind": "notify_ticket_created", "fields": {"ticket_id": "T1"}});
        let disposition = worker.process_entry(popped(payload)).await;

        assert_eq!(disposition, Disposition::Handled);
        let processed = broker.list(PROCESSED);
        assert_eq!(processed.len(), 1);
        assert!(broker.list(FAILED).is_empty());
        let record: ProcessedRecord = serde_json::from_str(&processed[0]).unwrap();
        assert_eq!(record.task.field_text("ticket_id").as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn test_missing_ticket_is_still_processed() {
        let (broker, _, worker) = worker();
        let payload = json!({"kind": "notify_ticket_created", "fields": {"ticket_id": "MISSING"}});

        assert_eq!(worker.process_entry(popped(payload)).await, Disposition::Handled);
        assert_eq!(broker.list(PROCESSED).len(), 1);
        assert!(broker.list(FAILED).is_empty());
    }

    #[tokio::test]
    async fn test_clear_cache_without_keys_is_processed() {
        let (broker, _, worker) = worker();
        let payload = json!({"kind": "clear_cache", "fields": {}});

        assert_eq!(worker.process_entry(popped(payload)).await, Disposition::Handled);
        assert_eq!(broker.list(PROCESSED).len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_recorded_raw() {
        let (broker, _, worker) = worker();

        let disposition = worker.process_entry(popped(json!("not-json"))).await;
        assert!(matches!(disposition, Disposition::Failed(_)));

        let failed = broker.list(FAILED);
        assert_eq!(failed.len(), 1);
        assert!(broker.list(PROCESSED).is_empty());
        let record: FailedRecord = serde_json::from_str(&failed[0]).unwrap();
        assert_eq!(
            record.task,
            FailedTask::Raw {
                raw: "not-json".into()
            }
        );
        assert!(record.error.contains("decode"));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_recorded_as_processed() {
        let (broker, store, worker) = worker();
        let payload = json!({"kind": "send_fax", "fields": {}});

        assert_eq!(worker.process_entry(popped(payload)).await, Disposition::Ignored);
        assert_eq!(broker.list(PROCESSED).len(), 1);
        assert_eq!(store.begun(), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_is_recorded_with_envelope() {
        let (broker, store, worker) = worker();
        store.set_failing(true);
        let payload = json!({"kind": "process_overdue_tickets", "fields": {}});

        let disposition = worker.process_entry(popped(payload)).await;
        assert!(matches!(disposition, Disposition::Failed(_)));

        let failed = broker.list(FAILED);
        assert_eq!(failed.len(), 1);
        let record: FailedRecord = serde_json::from_str(&failed[0]).unwrap();
        assert!(matches!(record.task, FailedTask::Envelope(ref e) if e.kind == "process_overdue_tickets"));
        assert_eq!(store.rolled_back(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_in_order() {
        let (broker, _, worker) = worker();
        for id in ["T1", "T2", "T3"] {
            let envelope = TaskEnvelope::new("notify_ticket_created").with_field("ticket_id", id);
            broker.push(MAIN, &[envelope.to_json().unwrap()]).await.unwrap();
        }

        let handle = worker.shutdown_handle();
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        wait_for_len(&broker, PROCESSED, 3).await;
        handle.cancel();
        running.await.unwrap().unwrap();

        let ids: Vec<String> = broker
            .list(PROCESSED)
            .iter()
            .map(|r| serde_json::from_str::<ProcessedRecord>(r).unwrap())
            .filter_map(|r| r.task.field_text("ticket_id"))
            .collect();
        assert_eq!(ids, vec!["T1", "T2", "T3"]);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_failure_backs_off_and_resumes() {
        let (broker, _, worker) = worker();
        broker.fail_next_pops(1);
        let envelope = TaskEnvelope::new("clear_cache");
        broker.push(MAIN, &[envelope.to_json().unwrap()]).await.unwrap();

        let started = Instant::now();
        let handle = worker.shutdown_handle();
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        wait_for_len(&broker, PROCESSED, 1).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(worker.state(), WorkerState::Running);

        handle.cancel();
        running.await.unwrap().unwrap();
        assert!(broker.list(FAILED).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let (broker, _, worker) = worker();
        broker.fail_next_pops(1);

        let started = Instant::now();
        let handle = worker.shutdown_handle();
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        running.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_invalid_utf8_entry_is_recorded_as_failed() {
        let (broker, _, worker) = worker();
        let entry = Popped::from_bytes(MAIN, vec![b'{', 0xff, 0xfe, b'}']);

        let disposition = worker.process_entry(entry).await;
        assert!(matches!(disposition, Disposition::Failed(ref e) if e.contains("UTF-8")));

        let failed = broker.list(FAILED);
        assert_eq!(failed.len(), 1);
        let record: FailedRecord = serde_json::from_str(&failed[0]).unwrap();
        assert!(matches!(record.task, FailedTask::Raw { ref raw } if raw.starts_with('{')));
    }

    #[tokio::test]
    async fn test_failed_record_quotes_wire_text() {
        let (broker, _, worker) = worker();
        broker.push(MAIN, &["\"x\"".to_string()]).await.unwrap();
        let entry = broker
            .blocking_pop(&[MAIN.to_string()], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        worker.process_entry(entry).await;
        let record: FailedRecord = serde_json::from_str(&broker.list(FAILED)[0]).unwrap();
        assert_eq!(record.task, FailedTask::Raw { raw: "\"x\"".into() });
    }

    #[tokio::test]
    async fn test_zero_pop_timeout_still_cancellable() {
        let broker = MemoryBroker::new();
        let config = WorkerConfig {
            pop_timeout: Duration::ZERO,
            ..WorkerConfig::default()
        };
        let worker = Arc::new(Worker::new(
            config,
            SharedBroker::new(broker.clone()),
            Arc::new(MemoryTicketStore::new()),
        ));

        let handle = worker.shutdown_handle();
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(2), running).await;
        assert!(finished.is_ok(), "worker did not stop");
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_startup() {
        let (broker, _, worker) = worker();
        broker.set_alive(false);

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, WorkerError::Startup(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_cancel_before_pop_leaves_queue_untouched() {
        let (broker, _, worker) = worker();
        broker.push(MAIN, &["{}".to_string()]).await.unwrap();
        worker.shutdown_handle().cancel();

        worker.run().await.unwrap();
        assert_eq!(broker.list(MAIN).len(), 1);
        assert!(broker.list(PROCESSED).is_empty());
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let (_, _, worker) = worker();
        let mut states = worker.subscribe();
        assert_eq!(*states.borrow_and_update(), WorkerState::Starting);

        worker.shutdown_handle().cancel();
        worker.run().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), WorkerState::Stopped);
    }
}
