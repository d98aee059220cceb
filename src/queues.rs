//! Queue and channel names used by the worker.

/// Default main queue.
pub const DEFAULT_MAIN_QUEUE: &str = "queue:batch:process";
/// Default processed ledger.
pub const DEFAULT_PROCESSED_QUEUE: &str = "queue:batch:processed";
/// Default failed ledger.
pub const DEFAULT_FAILED_QUEUE: &str = "queue:batch:failed";
/// Default notification channel.
pub const DEFAULT_EVENTS_CHANNEL: &str = "channel:batch:events";

/// Names of the lists and the pub/sub channel the worker touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    main: String,
    processed: String,
    failed: String,
    events: String,
}

impl QueueNames {
    /// Create a new set of names.
    pub fn new(
        main: impl Into<String>,
        processed: impl Into<String>,
        failed: impl Into<String>,
        events: impl Into<String>,
    ) -> Self {
        Self {
            main: main.into(),
            processed: processed.into(),
            failed: failed.into(),
            events: events.into(),
        }
    }

    /// Main queue (LIST). Producers push to the tail, the worker pops the head.
    pub fn main(&self) -> &str {
        &self.main
    }

    /// Processed ledger (LIST).
    pub fn processed(&self) -> &str {
        &self.processed
    }

    /// Failed ledger (LIST). Doubles as the dead-letter store.
    pub fn failed(&self) -> &str {
        &self.failed
    }

    /// Notification channel (PUB/SUB).
    pub fn events(&self) -> &str {
        &self.events
    }

    pub fn with_main(mut self, name: impl Into<String>) -> Self {
        self.main = name.into();
        self
    }

    pub fn with_processed(mut self, name: impl Into<String>) -> Self {
        self.processed = name.into();
        self
    }

    pub fn with_failed(mut self, name: impl Into<String>) -> Self {
        self.failed = name.into();
        self
    }

    pub fn with_events(mut self, name: impl Into<String>) -> Self {
        self.events = name.into();
        self
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAIN_QUEUE,
            DEFAULT_PROCESSED_QUEUE,
            DEFAULT_FAILED_QUEUE,
            DEFAULT_EVENTS_CHANNEL,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let names = QueueNames::default();
        assert_eq!(names.main(), "queue:batch:process");
        assert_eq!(names.processed(), "queue:batch:processed");
        assert_eq!(names.failed(), "queue:batch:failed");
        assert_eq!(names.events(), "channel:batch:events");
    }

    #[test]
    fn test_overrides() {
        let names = QueueNames::default()
            .with_main("tickets:in")
            .with_failed("tickets:dead");
        assert_eq!(names.main(), "tickets:in");
        assert_eq!(names.processed(), "queue:batch:processed");
        assert_eq!(names.failed(), "tickets:dead");
    }
}
