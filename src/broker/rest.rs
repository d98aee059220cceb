//! REST substrate: one HTTP request per command.
//!
//! Every command is a `POST` of `["COMMAND", "arg1", ...]` with a bearer token,
//! answered by `{"result": value}` or `{"error": message}`. There is no
//! blocking primitive, so [`Broker::blocking_pop`] is emulated by polling
//! `LPOP`. It is best-effort near-real-time: an entry pushed right after a
//! poll waits up to one poll interval.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use super::{deadline_after, normalize_value, Broker, BrokerResult, Popped};
use crate::error::BrokerError;

/// Default sleep between emulated-pop polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker over a REST endpoint.
#[derive(Clone)]
pub struct RestBroker {
    http: reqwest::Client,
    url: String,
    token: String,
    poll_interval: Duration,
}

impl RestBroker {
    /// Create a broker for `url`, authenticating with `token`.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> BrokerResult<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.into(),
            token: token.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Set the emulated-pop poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll interval in use.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Issue one command and return its raw `result`.
    async fn command(&self, command: &str, args: &[String]) -> BrokerResult<Value> {
        let mut body = Vec::with_capacity(args.len() + 1);
        body.push(command.to_ascii_uppercase());
        body.extend(args.iter().cloned());

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let reply: Value = serde_json::from_str(&text)
            .map_err(|e| BrokerError::MalformedResponse(format!("{}: {}", e, text)))?;
        parse_reply(reply)
    }

    /// Non-blocking pop of one key.
    async fn pop_once(&self, key: &str) -> BrokerResult<Option<Popped>> {
        let result = self.command("LPOP", &[key.to_string()]).await?;
        Ok(match result {
            Value::Null => None,
            value => Some(Popped::from_value(key, value)),
        })
    }
}

#[async_trait]
impl Broker for RestBroker {
    async fn get(&self, key: &str) -> BrokerResult<Option<Value>> {
        let result = self.command("GET", &[key.to_string()]).await?;
        Ok(match result {
            Value::Null => None,
            value => Some(normalize_value(value)),
        })
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<bool> {
        let args = [
            key.to_string(),
            ttl.as_secs().max(1).to_string(),
            value.to_string(),
        ];
        let result = self.command("SETEX", &args).await?;
        Ok(matches!(result, Value::String(ref s) if s.eq_ignore_ascii_case("OK")))
    }

    async fn delete(&self, keys: &[String]) -> BrokerResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result = self.command("DEL", keys).await?;
        integer("DEL", &result)
    }

    async fn push(&self, key: &str, values: &[String]) -> BrokerResult<u64> {
        if values.is_empty() {
            return self.len(key).await;
        }
        let mut args = Vec::with_capacity(values.len() + 1);
        args.push(key.to_string());
        args.extend(values.iter().cloned());
        let result = self.command("RPUSH", &args).await?;
        integer("RPUSH", &result)
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> BrokerResult<Option<Popped>> {
        if keys.is_empty() {
            return Ok(None);
        }
        let deadline = deadline_after(timeout);

        loop {
            for key in keys {
                if let Some(popped) = self.pop_once(key).await? {
                    return Ok(Some(popped));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tracing::debug!(keys = ?keys, "No entry yet, polling again");
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> BrokerResult<u64> {
        let result = self
            .command("PUBLISH", &[channel.to_string(), message.to_string()])
            .await?;
        integer("PUBLISH", &result)
    }

    async fn len(&self, key: &str) -> BrokerResult<u64> {
        let result = self.command("LLEN", &[key.to_string()]).await?;
        integer("LLEN", &result)
    }

    async fn range(&self, key: &str, start: i64, end: i64) -> BrokerResult<Vec<Value>> {
        let args = [key.to_string(), start.to_string(), end.to_string()];
        let result = self.command("LRANGE", &args).await?;
        Ok(match normalize_value(result) {
            Value::Null => Vec::new(),
            Value::Array(items) => items.into_iter().map(normalize_value).collect(),
            single => vec![single],
        })
    }

    async fn ping(&self) -> BrokerResult<bool> {
        let result = self.command("PING", &[]).await?;
        Ok(is_pong(&result))
    }
}

/// Split a reply envelope into its result or the broker-reported error.
fn parse_reply(reply: Value) -> BrokerResult<Value> {
    match reply {
        Value::Object(mut fields) => {
            if let Some(error) = fields.remove("error") {
                let message = match error {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                return Err(BrokerError::Command(message));
            }
            fields
                .remove("result")
                .ok_or_else(|| BrokerError::MalformedResponse("missing `result`".to_string()))
        }
        other => Err(BrokerError::MalformedResponse(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

fn integer(command: &str, value: &Value) -> BrokerResult<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        BrokerError::MalformedResponse(format!("{} expected an integer, got {}", command, value))
    })
}

/// The endpoint answers PING with "PONG", or with the string "[]" in place
/// of an empty reply. Both mean the broker is alive.
fn is_pong(value: &Value) -> bool {
    match value {
        Value::String(s) => s.eq_ignore_ascii_case("PONG") || s == "[]",
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
