//! Broker abstraction.
//!
//! One interface over two interchangeable substrates:
//!
//! - [`native::RedisBroker`] speaks the native protocol and blocks server-side
//!   on [`Broker::blocking_pop`].
//! - [`rest::RestBroker`] speaks a stateless HTTP protocol with no blocking
//!   primitive. Its `blocking_pop` polls a non-blocking pop and is best-effort
//!   near-real-time, not true blocking.
//!
//! The substrate is chosen once, in [`connect`]. Callers only see
//! [`SharedBroker`].

pub mod memory;
pub mod native;
pub mod rest;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::envelope::{decode_payload, TaskEnvelope};
use crate::error::{BrokerError, DecodeError};

/// Result type for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// An entry removed from a list by [`Broker::blocking_pop`].
#[derive(Debug, Clone, PartialEq)]
pub struct Popped {
    /// The list the entry came from.
    pub key: String,
    /// The entry, normalized with [`normalize_value`].
    pub payload: Value,
    /// The entry exactly as it came off the wire, when it was text.
    pub raw: Option<String>,
    /// The entry was not valid UTF-8; `raw` holds a lossy rendering.
    pub invalid_utf8: bool,
}

impl Popped {
    /// An entry read as text.
    pub fn from_text(key: impl Into<String>, text: String) -> Self {
        Self {
            key: key.into(),
            payload: normalize_text(text.clone()),
            raw: Some(text),
            invalid_utf8: false,
        }
    }

    /// An entry that may already be decoded.
    pub fn from_value(key: impl Into<String>, value: Value) -> Self {
        match value {
            Value::String(text) => Self::from_text(key, text),
            other => Self {
                key: key.into(),
                raw: Some(other.to_string()),
                payload: other,
                invalid_utf8: false,
            },
        }
    }

    /// An entry read as bytes. Non-UTF-8 input never decodes.
    pub fn from_bytes(key: impl Into<String>, bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::from_text(key, text),
            Err(e) => {
                let lossy = String::from_utf8_lossy(e.as_bytes()).into_owned();
                Self {
                    key: key.into(),
                    payload: Value::String(lossy.clone()),
                    raw: Some(lossy),
                    invalid_utf8: true,
                }
            }
        }
    }

    /// Decode the entry into an envelope.
    ///
    /// On failure the error quotes the original wire text rather than its
    /// normalized form.
    pub fn decode(&self) -> Result<TaskEnvelope, DecodeError> {
        if self.invalid_utf8 {
            return Err(DecodeError::new(
                "payload is not valid UTF-8",
                self.raw.clone().unwrap_or_default(),
            ));
        }
        decode_payload(&self.payload).map_err(|mut err| {
            if let Some(raw) = &self.raw {
                err.raw = raw.clone();
            }
            err
        })
    }
}

/// Deadline `timeout` from now, saturating far in the future instead of
/// overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

// Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Broker operations used by the worker, the router and the producer.
///
/// Implementations never retry; every transport failure is returned as a
/// [`BrokerError`]. Values read back from the broker are normalized: a
/// JSON-encoded string is returned decoded, anything else as a string.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> BrokerResult<Option<Value>>;

    /// Write a key that expires after `ttl`. Returns whether the broker
    /// acknowledged the write.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<bool>;

    /// Delete keys. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> BrokerResult<u64>;

    /// Append values to the tail of a list. Returns the new length.
    async fn push(&self, key: &str, values: &[String]) -> BrokerResult<u64>;

    /// Remove the head of the first non-empty list among `keys`, waiting up
    /// to `timeout` for one to appear.
    ///
    /// A zero timeout makes one non-blocking pass and returns `None` if every
    /// list is empty.
    async fn blocking_pop(&self, keys: &[String], timeout: Duration)
        -> BrokerResult<Option<Popped>>;

    /// Publish a message. Returns the number of subscribers that got it.
    async fn publish(&self, channel: &str, message: &str) -> BrokerResult<u64>;

    /// Length of a list.
    async fn len(&self, key: &str) -> BrokerResult<u64>;

    /// Read `start..=end` of a list. Negative indices count from the tail.
    async fn range(&self, key: &str, start: i64, end: i64) -> BrokerResult<Vec<Value>>;

    /// Liveness check. `Ok(true)` on PONG, `Ok(false)` on any other reply.
    async fn ping(&self) -> BrokerResult<bool>;
}

/// A type-erased broker that can be shared across tasks.
pub type DynBroker = Arc<dyn Broker>;

/// Wrapper around `Arc<dyn Broker>` for convenience.
#[derive(Clone)]
pub struct SharedBroker {
    inner: DynBroker,
}

impl SharedBroker {
    /// Create a new SharedBroker from any Broker implementation.
    pub fn new<B: Broker + 'static>(broker: B) -> Self {
        Self {
            inner: Arc::new(broker),
        }
    }
}

#[async_trait]
impl Broker for SharedBroker {
    async fn get(&self, key: &str) -> BrokerResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<bool> {
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> BrokerResult<u64> {
        self.inner.delete(keys).await
    }

    async fn push(&self, key: &str, values: &[String]) -> BrokerResult<u64> {
        self.inner.push(key, values).await
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> BrokerResult<Option<Popped>> {
        self.inner.blocking_pop(keys, timeout).await
    }

    async fn publish(&self, channel: &str, message: &str) -> BrokerResult<u64> {
        self.inner.publish(channel, message).await
    }

    async fn len(&self, key: &str) -> BrokerResult<u64> {
        self.inner.len(key).await
    }

    async fn range(&self, key: &str, start: i64, end: i64) -> BrokerResult<Vec<Value>> {
        self.inner.range(key, start, end).await
    }

    async fn ping(&self) -> BrokerResult<bool> {
        self.inner.ping().await
    }
}

/// Connect to the configured substrate.
///
/// `poll_interval` only matters for the REST substrate's emulated pop.
pub async fn connect(config: &BrokerConfig, poll_interval: Duration) -> BrokerResult<SharedBroker> {
    match config {
        BrokerConfig::Native {
            host,
            port,
            password,
        } => {
            let info = native::connection_info(host, *port, password.clone());
            let broker = native::RedisBroker::connect(info).await?;
            Ok(SharedBroker::new(broker))
        }
        BrokerConfig::Rest { url, token } => {
            let broker = rest::RestBroker::new(url, token)?.with_poll_interval(poll_interval);
            Ok(SharedBroker::new(broker))
        }
    }
}

/// Normalize a textual value read from the broker.
///
/// JSON-encoded text is decoded; anything that fails to decode is kept as
/// the raw string.
pub fn normalize_text(text: String) -> Value {
    match serde_json::from_str::<Value>(&text) {
        Ok(decoded) => decoded,
        Err(_) => Value::String(text),
    }
}

/// Normalize a value that may already be decoded.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(text) => normalize_text(text),
        other => other,
    }
}
