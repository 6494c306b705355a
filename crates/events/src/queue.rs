//! Delivery queue contract (mechanics only).
//!
//! A queue hands out messages with **at-least-once** semantics:
//!
//! - a received message is hidden for a visibility window and becomes visible
//!   again if it is not deleted in time (consumer crash, slow consumer);
//! - there is no ordering guarantee across messages;
//! - deleting a message does not prove nobody else processed it too.
//!
//! Consumers must therefore be idempotent. In this system that is the job of
//! the conditional updates on the record store, not of the queue.
//!
//! `receive` long-polls for up to `wait` before returning an empty batch.
//! A failed receive is not retried inline; callers log and poll again.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Contract maximum for messages per receive.
pub const MAX_RECEIVE_MESSAGES: usize = 10;

/// Contract maximum for a long-poll wait.
pub const MAX_RECEIVE_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The token is unknown or belongs to an earlier receive of the message.
    #[error("invalid or expired delivery token: {0}")]
    InvalidToken(String),

    #[error("queue state poisoned")]
    Poisoned,
}

/// Long-poll parameters, clamped to the contract maximums.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    max_messages: usize,
    wait: Duration,
}

impl ReceiveOptions {
    pub fn new(max_messages: usize, wait: Duration) -> Self {
        Self {
            max_messages: max_messages.clamp(1, MAX_RECEIVE_MESSAGES),
            wait: wait.min(MAX_RECEIVE_WAIT),
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::new(MAX_RECEIVE_MESSAGES, MAX_RECEIVE_WAIT)
    }
}

/// Handle proving a specific receive of a message; used to delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken(String);

impl DeliveryToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub body: String,
    pub token: DeliveryToken,
    /// 1 on first delivery; higher values are redeliveries.
    pub receive_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }
}

pub trait DeliveryQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a raw body; returns the message id.
    fn send(&self, body: String) -> Result<String, QueueError>;

    fn receive(&self, options: ReceiveOptions) -> Result<Vec<Delivery>, QueueError>;

    fn delete(&self, token: &DeliveryToken) -> Result<(), QueueError>;

    /// Push the message's visibility deadline to `now + extension`.
    fn extend_visibility(&self, token: &DeliveryToken, extension: Duration)
    -> Result<(), QueueError>;
}

impl<Q> DeliveryQueue for Arc<Q>
where
    Q: DeliveryQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn send(&self, body: String) -> Result<String, QueueError> {
        (**self).send(body)
    }

    fn receive(&self, options: ReceiveOptions) -> Result<Vec<Delivery>, QueueError> {
        (**self).receive(options)
    }

    fn delete(&self, token: &DeliveryToken) -> Result<(), QueueError> {
        (**self).delete(token)
    }

    fn extend_visibility(
        &self,
        token: &DeliveryToken,
        extension: Duration,
    ) -> Result<(), QueueError> {
        (**self).extend_visibility(token, extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_options_are_clamped() {
        let opts = ReceiveOptions::new(50, Duration::from_secs(60));
        assert_eq!(opts.max_messages(), MAX_RECEIVE_MESSAGES);
        assert_eq!(opts.wait(), MAX_RECEIVE_WAIT);

        let opts = ReceiveOptions::new(0, Duration::from_millis(5));
        assert_eq!(opts.max_messages(), 1);
        assert_eq!(opts.wait(), Duration::from_millis(5));
    }
}
