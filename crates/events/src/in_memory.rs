//! In-memory queue and topics for tests/dev.
//!
//! - No IO / no async
//! - Real visibility timeouts and long-polling (condvar)
//! - Topics fan out to every subscribed queue, SNS-style

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::publish::{PublishError, Publisher};
use crate::queue::{Delivery, DeliveryQueue, DeliveryToken, QueueError, ReceiveOptions};
use crate::topic::Topic;

/// Default visibility window for [`InMemoryQueue`].
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    visible_at: Instant,
    receipt: Option<String>,
    receive_count: u32,
}

/// Visibility-timeout queue.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    entries: Mutex<Vec<Entry>>,
    available: Condvar,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_visibility_timeout(name, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            entries: Mutex::new(Vec::new()),
            available: Condvar::new(),
        }
    }

    /// Messages not yet deleted (visible or in flight).
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by an unexpired receive.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|e| e.iter().filter(|m| m.visible_at > now).count())
            .unwrap_or(0)
    }
}

impl DeliveryQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, body: String) -> Result<String, QueueError> {
        let message_id = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        entries.push(Entry {
            message_id: message_id.clone(),
            body,
            visible_at: Instant::now(),
            receipt: None,
            receive_count: 0,
        });
        self.available.notify_all();
        Ok(message_id)
    }

    fn receive(&self, options: ReceiveOptions) -> Result<Vec<Delivery>, QueueError> {
        let deadline = Instant::now() + options.wait();
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;

        loop {
            let now = Instant::now();
            let mut batch = Vec::new();
            for entry in entries.iter_mut().filter(|e| e.visible_at <= now) {
                if batch.len() == options.max_messages() {
                    break;
                }
                let receipt = Uuid::new_v4().to_string();
                entry.visible_at = now + self.visibility_timeout;
                entry.receipt = Some(receipt.clone());
                entry.receive_count += 1;
                batch.push(Delivery {
                    message_id: entry.message_id.clone(),
                    body: entry.body.clone(),
                    token: DeliveryToken::new(receipt),
                    receive_count: entry.receive_count,
                });
            }

            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            // Wake for new sends, or when the earliest hidden message reappears.
            let next_visible = entries.iter().map(|e| e.visible_at).min();
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            let timeout = wake_at.saturating_duration_since(now).max(Duration::from_millis(1));
            entries = self
                .available
                .wait_timeout(entries, timeout)
                .map_err(|_| QueueError::Poisoned)?
                .0;
        }
    }

    fn delete(&self, token: &DeliveryToken) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        let pos = entries
            .iter()
            .position(|e| e.receipt.as_deref() == Some(token.as_str()))
            .ok_or_else(|| QueueError::InvalidToken(token.to_string()))?;
        entries.remove(pos);
        Ok(())
    }

    fn extend_visibility(
        &self,
        token: &DeliveryToken,
        extension: Duration,
    ) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.receipt.as_deref() == Some(token.as_str()))
            .ok_or_else(|| QueueError::InvalidToken(token.to_string()))?;
        entry.visible_at = Instant::now() + extension;
        Ok(())
    }
}

/// Topic → queues fan-out. Every publish is wrapped in an [`Envelope`] and
/// sent to each queue subscribed to the topic.
#[derive(Default)]
pub struct InMemoryTopics {
    subscriptions: RwLock<BTreeMap<Topic, Vec<Arc<dyn DeliveryQueue>>>>,
    published: Mutex<Vec<(Topic, String)>>,
}

impl InMemoryTopics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic, queue: Arc<dyn DeliveryQueue>) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.entry(topic).or_default().push(queue);
        }
    }

    /// Raw messages published on `topic`, oldest first.
    pub fn published(&self, topic: Topic) -> Vec<String> {
        self.published
            .lock()
            .map(|p| {
                p.iter()
                    .filter(|(t, _)| *t == topic)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl core::fmt::Debug for InMemoryTopics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryTopics").finish_non_exhaustive()
    }
}

impl Publisher for InMemoryTopics {
    fn publish_message(&self, topic: Topic, message: String) -> Result<(), PublishError> {
        let body = Envelope::new(topic, message.clone())
            .to_body()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        if let Ok(mut published) = self.published.lock() {
            published.push((topic, message));
        }

        let subs = self
            .subscriptions
            .read()
            .map_err(|_| PublishError::Unavailable("subscriptions poisoned".into()))?;
        let queues = subs.get(&topic).map(Vec::as_slice).unwrap_or_default();
        if queues.is_empty() {
            debug!(topic = %topic.as_str(), "published with no subscribers");
        }
        for queue in queues {
            if let Err(e) = queue.send(body.clone()) {
                warn!(topic = %topic.as_str(), queue = queue.name(), error = %e, "fan-out failed");
                return Err(PublishError::Unavailable(e.to_string()));
            }
        }
        debug!(topic = %topic.as_str(), subscribers = queues.len(), "message published");
        Ok(())
    }
}
