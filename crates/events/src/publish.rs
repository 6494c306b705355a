//! Fire-and-forget topic publishing.
//!
//! Publishing only hands the message to the transport. Nothing here waits for
//! or consumes delivery confirmation; downstream stages are idempotent, so a
//! caller that is unsure whether a publish went through may publish again.

use std::sync::Arc;

use thiserror::Error;

use crate::event::LifecycleEvent;
use crate::topic::Topic;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publisher unavailable: {0}")]
    Unavailable(String),

    #[error("{event} cannot be published on {topic}")]
    WrongTopic { topic: Topic, event: String },

    #[error("serialization failed: {0}")]
    Serialization(String),
}

pub trait Publisher: Send + Sync {
    /// Publish a raw message body (the envelope's `Message`).
    fn publish_message(&self, topic: Topic, message: String) -> Result<(), PublishError>;

    fn publish(&self, topic: Topic, event: &LifecycleEvent) -> Result<(), PublishError> {
        if topic.event_kind() != event.kind() {
            return Err(PublishError::WrongTopic {
                topic,
                event: event.kind().to_string(),
            });
        }
        let message = serde_json::to_string(event)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        self.publish_message(topic, message)
    }
}

impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    fn publish_message(&self, topic: Topic, message: String) -> Result<(), PublishError> {
        (**self).publish_message(topic, message)
    }

    fn publish(&self, topic: Topic, event: &LifecycleEvent) -> Result<(), PublishError> {
        (**self).publish(topic, event)
    }
}
