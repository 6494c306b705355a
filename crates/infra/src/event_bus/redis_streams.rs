//! Redis Streams transport (durable, at-least-once delivery).
//!
//! - **Stream per topic**: `{prefix}:{topic}` (e.g. `annoflow:job_requests`)
//! - **Consumer group per stage**: every stage subscribed to a topic gets its
//!   own copy of each message, so groups give the topic fan-out
//! - **Visibility timeout**: an entry left pending longer than the timeout is
//!   claimed again by the next receive (from any consumer in the group)
//! - **Delivery token**: the stream entry id

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use annoflow_events::{
    Delivery, DeliveryQueue, DeliveryToken, Envelope, PublishError, Publisher, QueueError,
    ReceiveOptions, Topic,
};

/// Default stream key prefix.
pub const DEFAULT_STREAM_PREFIX: &str = "annoflow";

const BODY_FIELD: &str = "body";

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<RedisStreamsError> for QueueError {
    fn from(err: RedisStreamsError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

impl From<RedisStreamsError> for PublishError {
    fn from(err: RedisStreamsError) -> Self {
        PublishError::Unavailable(err.to_string())
    }
}

pub fn stream_key(prefix: &str, topic: Topic) -> String {
    format!("{prefix}:{}", topic.as_str())
}

fn connect(client: &redis::Client) -> Result<redis::Connection, RedisStreamsError> {
    client
        .get_connection()
        .map_err(|e| RedisStreamsError::Connection(e.to_string()))
}

/// One stage's view of a topic stream.
#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl RedisStreamsQueue {
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.into(),
            group: group.into(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            visibility_timeout,
        })
    }

    /// Ensure the consumer group exists (idempotent).
    ///
    /// New groups start at `$`: only messages published after the group was
    /// created are delivered to it.
    pub fn ensure_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = connect(&self.client)?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => {
                debug!(stream = %self.stream_key, group = %self.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn visibility_ms(&self) -> u64 {
        self.visibility_timeout.as_millis() as u64
    }

    /// Claim entries whose previous receive has expired.
    fn claim_expired(
        &self,
        conn: &mut redis::Connection,
        count: usize,
    ) -> Result<Vec<Delivery>, RedisStreamsError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.visibility_ms())
            .arg("-")
            .arg("+")
            .arg(count)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let deliveries: HashMap<&str, u64> = pending
            .iter()
            .map(|(id, _, _, delivered)| (id.as_str(), *delivered))
            .collect();
        let ids: Vec<&str> = pending.iter().map(|(id, ..)| id.as_str()).collect();

        // Re-checks the idle time, so a concurrent claim by another consumer wins.
        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_ms())
            .arg(&ids[..])
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;

        let (readable, unreadable) = self.sort_entries(entry_list(claimed));
        self.ack_unreadable(conn, &unreadable);
        Ok(readable
            .into_iter()
            .map(|(id, body)| {
                let receive_count = deliveries.get(id.as_str()).map_or(2, |d| *d as u32 + 1);
                delivery(id, body, receive_count)
            })
            .collect())
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        count: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, RedisStreamsError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count);
        // BLOCK 0 would block forever.
        if !wait.is_zero() {
            cmd.arg("BLOCK").arg(wait.as_millis() as u64);
        }
        let reply: redis::Value = cmd
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        let (readable, unreadable) = self.sort_entries(stream_entries(reply, &self.stream_key));
        self.ack_unreadable(conn, &unreadable);
        Ok(readable
            .into_iter()
            .map(|(id, body)| delivery(id, body, 1))
            .collect())
    }

    fn sort_entries(&self, entries: Vec<redis::Value>) -> (Vec<(String, String)>, Vec<String>) {
        let (readable, unreadable) = split_entries(entries);
        for (id, e) in &unreadable {
            warn!(stream = %self.stream_key, entry = id.as_deref().unwrap_or("?"), error = %e, "dropping unreadable entry");
        }
        (readable, unreadable.into_iter().filter_map(|(id, _)| id).collect())
    }

    /// Acknowledge entries that can never be delivered, so they do not come
    /// back after every visibility timeout.
    fn ack_unreadable(&self, conn: &mut redis::Connection, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let acked: redis::RedisResult<u64> = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(ids)
            .query(conn);
        if let Err(e) = acked {
            warn!(stream = %self.stream_key, error = %e, "failed to acknowledge unreadable entries");
        }
    }
}

fn delivery(id: String, body: String, receive_count: u32) -> Delivery {
    Delivery {
        message_id: id.clone(),
        body,
        token: DeliveryToken::new(id),
        receive_count,
    }
}

impl DeliveryQueue for RedisStreamsQueue {
    fn name(&self) -> &str {
        &self.group
    }

    #[instrument(skip(self, body), fields(stream = %self.stream_key), err)]
    fn send(&self, body: String) -> Result<String, QueueError> {
        let mut conn = connect(&self.client)?;
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(&body)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;
        Ok(id)
    }

    fn receive(&self, options: ReceiveOptions) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = connect(&self.client)?;
        let expired = self.claim_expired(&mut conn, options.max_messages())?;
        if !expired.is_empty() {
            return Ok(expired);
        }
        Ok(self.read_new(&mut conn, options.max_messages(), options.wait())?)
    }

    fn delete(&self, token: &DeliveryToken) -> Result<(), QueueError> {
        let mut conn = connect(&self.client)?;
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(token.as_str())
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        if acked == 0 {
            return Err(QueueError::InvalidToken(token.to_string()));
        }
        // Other groups on the same stream still need the entry; it is trimmed
        // by stream retention, not here.
        Ok(())
    }

    /// Resets the entry's idle time. The extension cannot exceed the
    /// configured visibility timeout.
    fn extend_visibility(&self, token: &DeliveryToken, extension: Duration) -> Result<(), QueueError> {
        let idle = self.visibility_timeout.saturating_sub(extension).as_millis() as u64;
        let mut conn = connect(&self.client)?;
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(token.as_str())
            .arg("IDLE")
            .arg(idle)
            .arg("JUSTID")
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;
        if claimed.is_empty() {
            return Err(QueueError::InvalidToken(token.to_string()));
        }
        Ok(())
    }
}

/// Publishes envelopes onto topic streams.
#[derive(Debug, Clone)]
pub struct RedisTopicPublisher {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisTopicPublisher {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.into(),
        })
    }
}

impl Publisher for RedisTopicPublisher {
    #[instrument(skip(self, message), fields(topic = %topic), err)]
    fn publish_message(&self, topic: Topic, message: String) -> Result<(), PublishError> {
        let body = Envelope::new(topic, message)
            .to_body()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        let mut conn = connect(&self.client)?;
        let _: String = redis::cmd("XADD")
            .arg(stream_key(&self.prefix, topic))
            .arg("*")
            .arg(BODY_FIELD)
            .arg(&body)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }
}

/// Entries of one stream in an `XREADGROUP` reply.
///
/// Reply format: `[[stream_key, [entry, ...]], ...]`, or nil on timeout.
fn stream_entries(reply: redis::Value, key: &str) -> Vec<redis::Value> {
    let redis::Value::Bulk(streams) = reply else {
        return Vec::new();
    };
    for stream in streams {
        let redis::Value::Bulk(mut parts) = stream else {
            continue;
        };
        if parts.len() != 2 {
            continue;
        }
        let entries = parts.pop();
        let name = parts.pop();
        if let (Some(redis::Value::Data(name)), Some(entries)) = (name, entries) {
            if name == key.as_bytes() {
                return entry_list(entries);
            }
        }
    }
    Vec::new()
}

fn entry_list(value: redis::Value) -> Vec<redis::Value> {
    match value {
        redis::Value::Bulk(entries) => entries,
        _ => Vec::new(),
    }
}

/// Readable `(id, body)` pairs, and the failures with the entry id when the
/// entry still carried one.
fn split_entries(
    entries: Vec<redis::Value>,
) -> (Vec<(String, String)>, Vec<(Option<String>, RedisStreamsError)>) {
    let mut readable = Vec::new();
    let mut unreadable = Vec::new();
    for entry in entries {
        let id = entry_id(&entry);
        match parse_stream_entry(entry) {
            Ok(parsed) => readable.push(parsed),
            Err(e) => unreadable.push((id, e)),
        }
    }
    (readable, unreadable)
}

fn entry_id(entry: &redis::Value) -> Option<String> {
    match entry {
        redis::Value::Bulk(parts) => match parts.first() {
            Some(redis::Value::Data(id)) => Some(String::from_utf8_lossy(id).to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Parse a stream entry `[id, [field, value, ...]]` into `(id, body)`.
fn parse_stream_entry(entry: redis::Value) -> Result<(String, String), RedisStreamsError> {
    let entry_vec = match entry {
        redis::Value::Bulk(v) => v,
        // XCLAIM returns nil for entries deleted while pending.
        redis::Value::Nil => {
            return Err(RedisStreamsError::Deserialization("entry was deleted".to_string()));
        }
        _ => return Err(RedisStreamsError::Deserialization("Invalid entry format".to_string())),
    };

    if entry_vec.len() < 2 {
        return Err(RedisStreamsError::Deserialization("Entry too short".to_string()));
    }

    let message_id = match &entry_vec[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return Err(RedisStreamsError::Deserialization("Invalid message ID format".to_string())),
    };

    let fields = match &entry_vec[1] {
        redis::Value::Bulk(v) => v,
        _ => return Err(RedisStreamsError::Deserialization("Invalid fields format".to_string())),
    };

    for chunk in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            if key.as_slice() == BODY_FIELD.as_bytes() {
                return Ok((message_id, String::from_utf8_lossy(value).to_string()));
            }
        }
    }

    Err(RedisStreamsError::Deserialization(format!(
        "entry {message_id} has no {BODY_FIELD} field"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, body: &str) -> Value {
        Value::Bulk(vec![data(id), Value::Bulk(vec![data("body"), data(body)])])
    }

    #[test]
    fn parses_body_field() {
        let (id, body) = parse_stream_entry(entry("1-0", "{\"Type\":\"Notification\"}")).unwrap();
        assert_eq!(id, "1-0");
        assert_eq!(body, "{\"Type\":\"Notification\"}");
    }

    #[test]
    fn entry_without_body_is_rejected() {
        let e = Value::Bulk(vec![data("1-0"), Value::Bulk(vec![data("other"), data("x")])]);
        assert!(matches!(
            parse_stream_entry(e),
            Err(RedisStreamsError::Deserialization(_))
        ));
        assert!(parse_stream_entry(Value::Nil).is_err());
    }

    #[test]
    fn unreadable_entries_are_split_out_with_their_ids() {
        let entries = vec![
            entry("1-0", "a"),
            Value::Bulk(vec![data("2-0"), Value::Bulk(vec![data("other"), data("x")])]),
            Value::Nil,
        ];
        let (readable, unreadable) = split_entries(entries);
        assert_eq!(readable, vec![("1-0".to_string(), "a".to_string())]);
        let ids: Vec<_> = unreadable.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![Some("2-0".to_string()), None]);
    }

    #[test]
    fn picks_entries_of_requested_stream() {
        let reply = Value::Bulk(vec![
            Value::Bulk(vec![data("annoflow:job_results"), Value::Bulk(vec![entry("9-0", "x")])]),
            Value::Bulk(vec![
                data("annoflow:job_requests"),
                Value::Bulk(vec![entry("1-0", "a"), entry("2-0", "b")]),
            ]),
        ]);
        let entries = stream_entries(reply, "annoflow:job_requests");
        assert_eq!(entries.len(), 2);
        assert!(stream_entries(Value::Nil, "annoflow:job_requests").is_empty());
    }

    #[test]
    fn stream_key_uses_topic_name() {
        assert_eq!(stream_key(DEFAULT_STREAM_PREFIX, Topic::JobThaw), "annoflow:job_thaw");
    }
}
