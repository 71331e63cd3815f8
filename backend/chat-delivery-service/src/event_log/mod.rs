//! Durable, ordered record of message lifecycle events.
//!
//! The log is the system of record for cross-instance delivery of message
//! events. Publishing is at-least-once: callers retry, consumers tolerate
//! duplicates.

use async_trait::async_trait;
use event_schema::{EventEnvelope, MessageEvent};
use resilience::{with_retry, with_timeout_result, RetryConfig, RetryError, TimeoutError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod kafka;
pub mod memory;

pub use kafka::KafkaEventLog;
pub use memory::InMemoryEventLog;

/// One keyed record on the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Partitioning key; the conversation id, so a conversation's events stay ordered.
    pub key: String,
    pub payload: Vec<u8>,
    /// Carried as a header so consumers can filter without decoding.
    pub event_type: Option<String>,
}

#[derive(Debug, Error, Clone)]
pub enum EventLogError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("publish gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("event log configuration error: {0}")]
    Config(String),
    #[error("event encoding failed: {0}")]
    Encode(String),
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one record. A single attempt; retry policy belongs to the caller.
    async fn publish(&self, record: LogRecord) -> Result<(), EventLogError>;

    /// Open a consumer over the whole topic.
    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>, EventLogError>;
}

#[async_trait]
pub trait EventSubscription: Send {
    /// Next record, or `Ok(None)` once the log is closed for good.
    async fn next_record(&mut self) -> Result<Option<LogRecord>, EventLogError>;
}

/// Encodes message events into envelopes and publishes them with retry and
/// a per-attempt timeout.
#[derive(Clone)]
pub struct EventPublisher {
    log: Arc<dyn EventLog>,
    source: String,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl EventPublisher {
    pub fn new(
        log: Arc<dyn EventLog>,
        source: impl Into<String>,
        retry: RetryConfig,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            log,
            source: source.into(),
            retry,
            attempt_timeout,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn envelope(
        &self,
        event: MessageEvent,
        event_id: Option<Uuid>,
    ) -> EventEnvelope<MessageEvent> {
        let envelope = EventEnvelope::new(self.source.clone(), event);
        match event_id {
            Some(id) => envelope.with_event_id(id),
            None => envelope,
        }
    }

    /// Publish `event`; returns the event id on success.
    pub async fn publish(
        &self,
        event: MessageEvent,
        event_id: Option<Uuid>,
    ) -> Result<Uuid, EventLogError> {
        let envelope = self.envelope(event, event_id);
        let record = LogRecord {
            key: envelope.data.conversation_id().to_string(),
            payload: serde_json::to_vec(&envelope)
                .map_err(|e| EventLogError::Encode(e.to_string()))?,
            event_type: Some(envelope.data.event_type().to_string()),
        };

        let result = with_retry(self.retry.clone(), || {
            let record = record.clone();
            async move {
                with_timeout_result(self.attempt_timeout, self.log.publish(record))
                    .await
                    .map_err(|e| match e {
                        TimeoutError::Elapsed(d) => EventLogError::Timeout(d),
                        TimeoutError::Failed(inner) => inner,
                    })
            }
        })
        .await;

        match result {
            Ok(()) => Ok(envelope.event_id),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => Err(EventLogError::Exhausted {
                attempts,
                last_error: last_error.to_string(),
            }),
            Err(RetryError::Permanent(e)) => Err(e),
        }
    }
}
