//! Infrastructure-backed transports.
//!
//! The queue and publisher contracts live in `annoflow-events` as pure
//! mechanics. This module provides the Redis Streams implementation.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsQueue, RedisTopicPublisher, DEFAULT_STREAM_PREFIX};
