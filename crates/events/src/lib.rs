//! Lifecycle events and the transport contracts that carry them between stages.

pub mod envelope;
pub mod event;
pub mod in_memory;
pub mod publish;
pub mod queue;
pub mod topic;

pub use envelope::{decode, ColdStorageNotification, Envelope, EnvelopeError};
pub use event::{
    ArchiveCandidate, EventKind, JobRequested, LifecycleEvent, ResultsReady, RetrievalReady,
    UpgradeRequested, UploadCompleted,
};
pub use in_memory::{InMemoryQueue, InMemoryTopics};
pub use publish::{PublishError, Publisher};
pub use queue::{
    Delivery, DeliveryQueue, DeliveryToken, QueueError, ReceiveOptions, MAX_RECEIVE_MESSAGES,
    MAX_RECEIVE_WAIT,
};
pub use topic::Topic;
