//! In-process substrate for tests and local dry runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{deadline_after, normalize_text, Broker, BrokerResult, Popped};
use crate::error::BrokerError;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, (String, Instant)>,
    published: Vec<(String, String)>,
}

/// Broker that keeps lists, keys and published messages in memory.
///
/// Clones share state. Blocking pops wake up as soon as a push lands.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    pushed: Arc<Notify>,
    alive: Arc<AtomicBool>,
    pop_failures: Arc<AtomicUsize>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            pushed: Arc::new(Notify::new()),
            alive: Arc::new(AtomicBool::new(true)),
            pop_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make `ping` report the broker as down (or up again).
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Make the next `count` pops fail with a transport error.
    pub fn fail_next_pops(&self, count: usize) {
        self.pop_failures.store(count, Ordering::SeqCst);
    }

    /// Raw contents of a list, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages published so far, as `(channel, message)`.
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }

    /// Whether a non-expired key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .values
            .get(key)
            .map(|(_, expires_at)| *expires_at > now)
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain collections behind.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_pop_failure(&self) -> bool {
        self.pop_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn pop_once(&self, keys: &[String]) -> Option<Popped> {
        let mut state = self.lock();
        keys.iter().find_map(|key| {
            let text = state.lists.get_mut(key)?.pop_front()?;
            Some(Popped::from_text(key.clone(), text))
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn get(&self, key: &str) -> BrokerResult<Option<Value>> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.values.get(key).cloned() {
            Some((value, expires_at)) if expires_at > now => Ok(Some(normalize_text(value))),
            Some(_) => {
                state.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<bool> {
        let expires_at = deadline_after(ttl);
        self.lock()
            .values
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> BrokerResult<u64> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut removed = 0;
        for key in keys {
            let live_value = matches!(state.values.remove(key), Some((_, expires_at)) if expires_at > now);
            let list = state.lists.remove(key).is_some();
            if live_value || list {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn push(&self, key: &str, values: &[String]) -> BrokerResult<u64> {
        let len = {
            let mut state = self.lock();
            let list = state.lists.entry(key.to_string()).or_default();
            list.extend(values.iter().cloned());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> BrokerResult<Option<Popped>> {
        if self.take_pop_failure() {
            return Err(BrokerError::Command("injected pop failure".to_string()));
        }
        let deadline = deadline_after(timeout);

        loop {
            let pushed = self.pushed.notified();
            if let Some(popped) = self.pop_once(keys) {
                return Ok(Some(popped));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(self.pop_once(keys));
            }
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> BrokerResult<u64> {
        self.lock()
            .published
            .push((channel.to_string(), message.to_string()));
        Ok(0)
    }

    async fn len(&self, key: &str) -> BrokerResult<u64> {
        Ok(self.lock().lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn range(&self, key: &str, start: i64, end: i64) -> BrokerResult<Vec<Value>> {
        let state = self.lock();
        let list = match state.lists.get(key) {
            Some(list) => list,
            None => return Ok(Vec::new()),
        };
        let len = list.len() as i64;
        let resolve = |index: i64| if index < 0 { len + index } else { index };
        let start = resolve(start).max(0);
        let end = resolve(end).min(len - 1);
        if start > end {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((end - start + 1) as usize)
            .cloned()
            .map(normalize_text)
            .collect())
    }

    async fn ping(&self) -> BrokerResult<bool> {
        Ok(self.alive.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_push_pop_is_fifo() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.push("q", &strings(&["1", "2"])).await.unwrap(), 2);
        assert_eq!(broker.push("q", &strings(&["3"])).await.unwrap(), 3);

        let keys = strings(&["q"]);
        for expected in [1, 2, 3] {
            let popped = broker.blocking_pop(&keys, Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(popped.payload, json!(expected));
        }
        assert_eq!(broker.blocking_pop(&keys, Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let broker = MemoryBroker::new();
        let producer = broker.clone();
        let waiter = tokio::spawn(async move {
            broker
                .blocking_pop(&strings(&["q"]), Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.push("q", &strings(&["hello"])).await.unwrap();

        let popped = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(popped.key, "q");
        assert_eq!(popped.payload, json!("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_times_out() {
        let broker = MemoryBroker::new();
        let started = Instant::now();
        let popped = broker
            .blocking_pop(&strings(&["q"]), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(popped, None);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_blocking_pop_with_huge_timeout() {
        let broker = MemoryBroker::new();
        broker.push("q", &strings(&["1"])).await.unwrap();
        let popped = broker
            .blocking_pop(&strings(&["q"]), Duration::MAX)
            .await
            .unwrap();
        assert_eq!(popped.map(|p| p.payload), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_injected_pop_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_pops(1);
        assert!(broker.blocking_pop(&strings(&["q"]), Duration::ZERO).await.is_err());
        assert!(broker.blocking_pop(&strings(&["q"]), Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_range_with_negative_indices() {
        let broker = MemoryBroker::new();
        broker.push("q", &strings(&["a", "b", "c", "d"])).await.unwrap();
        assert_eq!(
            broker.range("q", -3, -1).await.unwrap(),
            vec![json!("b"), json!("c"), json!("d")]
        );
        assert_eq!(broker.range("q", 0, 0).await.unwrap(), vec![json!("a")]);
        assert_eq!(broker.range("q", -10, 100).await.unwrap().len(), 4);
        assert!(broker.range("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_expire_and_delete() {
        let broker = MemoryBroker::new();
        broker
            .set_with_expiry("ticket:1", r#"{"id":1}"#, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(broker.get("ticket:1").await.unwrap(), Some(json!({"id": 1})));
        assert_eq!(
            broker
                .delete(&strings(&["ticket:1", "ticket:2"]))
                .await
                .unwrap(),
            1
        );
        assert_eq!(broker.get("ticket:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ping_follows_alive_flag() {
        let broker = MemoryBroker::new();
        assert!(broker.ping().await.unwrap());
        broker.set_alive(false);
        assert!(!broker.ping().await.unwrap());
    }
}
