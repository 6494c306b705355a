//! Wire envelope and ingress decoding.
//!
//! Every queue message body is a notification envelope:
//!
//! ```text
//! {"Type":"Notification","MessageId":"…","TopicArn":"job_results","Message":"<json string>"}
//! ```
//!
//! `Message` is itself JSON. For stage-to-stage topics it is a
//! [`LifecycleEvent`] (the `event` tag may be omitted, the topic implies it;
//! values may still arrive in `{"S": "..."}` / `{"N": "..."}` attribute form).
//! On [`Topic::JobRestore`] it may instead be a cold-storage job notification,
//! which is accepted only for a successful archive retrieval.
//!
//! Anything that does not decode into the topic's event kind is rejected here
//! and never reaches a stage processor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use annoflow_core::{ArchiveId, JobId, RetrievalJobId};

use crate::event::{EventKind, LifecycleEvent, RetrievalReady};
use crate::topic::Topic;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid event: {0}")]
    Invalid(String),

    #[error("expected {expected} event, found {found}")]
    UnexpectedKind { expected: EventKind, found: EventKind },

    /// A well-formed notification that is not an actionable event.
    #[error("rejected notification: {0}")]
    Rejected(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Notification envelope around a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Type", default = "notification_type")]
    pub kind: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "TopicArn")]
    pub topic: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

fn notification_type() -> String {
    "Notification".to_string()
}

impl Envelope {
    pub fn new(topic: Topic, message: impl Into<String>) -> Self {
        Self {
            kind: notification_type(),
            message_id: Uuid::new_v4().to_string(),
            topic: topic.as_str().to_string(),
            message: message.into(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn for_event(topic: Topic, event: &LifecycleEvent) -> Result<Self, EnvelopeError> {
        let message =
            serde_json::to_string(event).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
        Ok(Self::new(topic, message))
    }

    pub fn to_body(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    pub fn parse(body: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(body)
            .map_err(|e| EnvelopeError::Malformed(format!("envelope: {e}")))
    }
}

/// Decode a queue message body into the event kind carried by `topic`.
pub fn decode(topic: Topic, body: &str) -> Result<LifecycleEvent, EnvelopeError> {
    let envelope = Envelope::parse(body)?;
    let inner: Value = serde_json::from_str(&envelope.message)
        .map_err(|e| EnvelopeError::Malformed(format!("message: {e}")))?;

    let Value::Object(mut fields) = inner else {
        return Err(EnvelopeError::Malformed("message is not an object".into()));
    };

    if topic == Topic::JobRestore && fields.contains_key("Action") {
        let notification: ColdStorageNotification = serde_json::from_value(Value::Object(fields))
            .map_err(|e| EnvelopeError::Malformed(format!("cold storage notification: {e}")))?;
        return notification.into_event();
    }

    flatten_attribute_values(&mut fields);
    let expected = topic.event_kind();
    fields
        .entry("event")
        .or_insert_with(|| Value::String(expected.as_str().to_string()));

    let event: LifecycleEvent = serde_json::from_value(Value::Object(fields))
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    if event.kind() != expected {
        return Err(EnvelopeError::UnexpectedKind {
            expected,
            found: event.kind(),
        });
    }
    event
        .validate()
        .map_err(|e| EnvelopeError::Invalid(e.to_string()))?;
    Ok(event)
}

/// Unwrap `{"S": "x"}` → `"x"` and `{"N": "12"}` → `12`, recursively.
fn flatten_attribute_values(fields: &mut Map<String, Value>) {
    for value in fields.values_mut() {
        let replacement = match value {
            Value::Object(inner) if inner.len() == 1 => match inner.iter().next() {
                Some((tag, Value::String(s))) if tag == "S" => Some(Value::String(s.clone())),
                Some((tag, Value::String(n))) if tag == "N" => n
                    .parse::<i64>()
                    .ok()
                    .map(|n| Value::Number(n.into())),
                _ => None,
            },
            _ => None,
        };

        match replacement {
            Some(v) => *value = v,
            None => {
                if let Value::Object(inner) = value {
                    flatten_attribute_values(inner);
                }
            }
        }
    }
}

/// Job-completion notification emitted by cold storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ColdStorageNotification {
    pub action: String,
    pub status_code: String,
    pub archive_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_description: Option<String>,
}

impl ColdStorageNotification {
    pub const ARCHIVE_RETRIEVAL: &'static str = "ArchiveRetrieval";
    pub const SUCCEEDED: &'static str = "Succeeded";

    pub fn retrieval_succeeded(
        archive_id: &ArchiveId,
        retrieval_job_id: &RetrievalJobId,
        description: Option<String>,
    ) -> Self {
        Self {
            action: Self::ARCHIVE_RETRIEVAL.to_string(),
            status_code: Self::SUCCEEDED.to_string(),
            archive_id: archive_id.to_string(),
            job_id: retrieval_job_id.to_string(),
            job_description: description,
        }
    }

    /// Fails closed: only a succeeded archive retrieval becomes an event.
    pub fn into_event(self) -> Result<LifecycleEvent, EnvelopeError> {
        if self.action != Self::ARCHIVE_RETRIEVAL || self.status_code != Self::SUCCEEDED {
            return Err(EnvelopeError::Rejected(format!(
                "action={} status={}",
                self.action, self.status_code
            )));
        }

        let archive_id =
            ArchiveId::new(self.archive_id).map_err(|e| EnvelopeError::Invalid(e.to_string()))?;
        let retrieval_job_id =
            RetrievalJobId::new(self.job_id).map_err(|e| EnvelopeError::Invalid(e.to_string()))?;
        let job_id = self
            .job_description
            .filter(|d| !d.trim().is_empty())
            .map(JobId::new)
            .transpose()
            .map_err(|e| EnvelopeError::Invalid(e.to_string()))?;

        Ok(LifecycleEvent::RetrievalReady(RetrievalReady {
            archive_id,
            retrieval_job_id,
            job_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annoflow_core::UserId;
    use crate::event::UpgradeRequested;

    fn body(topic: Topic, message: &str) -> String {
        Envelope::new(topic, message).to_body().unwrap()
    }

    #[test]
    fn decodes_tagged_event() {
        let event = LifecycleEvent::UpgradeRequested(UpgradeRequested {
            user_id: UserId::new("U1").unwrap(),
        });
        let raw = Envelope::for_event(Topic::JobThaw, &event).unwrap().to_body().unwrap();
        assert_eq!(decode(Topic::JobThaw, &raw).unwrap(), event);
    }

    #[test]
    fn topic_implies_missing_tag_and_attribute_values_are_unwrapped() {
        let raw = body(
            Topic::JobResults,
            r#"{"job_id":{"S":"J1"},"user_id":{"S":"U1"},"complete_time":{"N":"1700000000"}}"#,
        );
        match decode(Topic::JobResults, &raw).unwrap() {
            LifecycleEvent::ResultsReady(e) => {
                assert_eq!(e.job_id.as_str(), "J1");
                assert_eq!(e.complete_time, 1_700_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_kind_for_topic_is_rejected() {
        let raw = body(Topic::JobArchive, r#"{"event":"upgrade_requested","user_id":"U1"}"#);
        assert!(matches!(
            decode(Topic::JobArchive, &raw),
            Err(EnvelopeError::UnexpectedKind { .. })
        ));
    }

    #[test]
    fn missing_fields_are_malformed() {
        let raw = body(Topic::JobResults, r#"{"job_id":"J1"}"#);
        assert!(matches!(decode(Topic::JobResults, &raw), Err(EnvelopeError::Malformed(_))));
        assert!(matches!(decode(Topic::JobResults, "not json"), Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn cold_storage_success_carries_originating_job() {
        let n = ColdStorageNotification::retrieval_succeeded(
            &ArchiveId::new("A1").unwrap(),
            &RetrievalJobId::new("R1").unwrap(),
            Some("J1".into()),
        );
        let raw = body(Topic::JobRestore, &serde_json::to_string(&n).unwrap());
        match decode(Topic::JobRestore, &raw).unwrap() {
            LifecycleEvent::RetrievalReady(e) => {
                assert_eq!(e.archive_id.as_str(), "A1");
                assert_eq!(e.retrieval_job_id.as_str(), "R1");
                assert_eq!(e.job_id.map(|j| j.into_string()), Some("J1".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cold_storage_failure_fails_closed() {
        let message = r#"{"Action":"InventoryRetrieval","StatusCode":"Succeeded","ArchiveId":"A1","JobId":"R1"}"#;
        let raw = body(Topic::JobRestore, message);
        assert!(matches!(decode(Topic::JobRestore, &raw), Err(EnvelopeError::Rejected(_))));

        let message = r#"{"Action":"ArchiveRetrieval","StatusCode":"Failed","ArchiveId":"A1","JobId":"R1"}"#;
        let raw = body(Topic::JobRestore, message);
        assert!(matches!(decode(Topic::JobRestore, &raw), Err(EnvelopeError::Rejected(_))));
    }
}
