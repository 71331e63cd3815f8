use super::{EventLog, EventLogError, EventSubscription, LogRecord};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

/// In-process log. Every subscriber sees every record published after it
/// subscribed, like a consumer group per instance with `latest` offsets.
pub struct InMemoryEventLog {
    tx: broadcast::Sender<LogRecord>,
    published: Mutex<Vec<LogRecord>>,
    failures_remaining: AtomicU32,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            published: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` publish calls.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Everything accepted so far, in append order.
    pub fn published(&self) -> Vec<LogRecord> {
        self.published
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn publish(&self, record: LogRecord) -> Result<(), EventLogError> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EventLogError::Publish("injected failure".into()));
        }

        if let Ok(mut guard) = self.published.lock() {
            guard.push(record.clone());
        }
        let _ = self.tx.send(record);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>, EventLogError> {
        Ok(Box::new(InMemorySubscription {
            rx: self.tx.subscribe(),
        }))
    }
}

struct InMemorySubscription {
    rx: broadcast::Receiver<LogRecord>,
}

#[async_trait]
impl EventSubscription for InMemorySubscription {
    async fn next_record(&mut self) -> Result<Option<LogRecord>, EventLogError> {
        loop {
            match self.rx.recv().await {
                Ok(record) => return Ok(Some(record)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-memory subscriber lagged; records skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str) -> LogRecord {
        LogRecord {
            key: key.into(),
            payload: b"{}".to_vec(),
            event_type: None,
        }
    }

    #[tokio::test]
    async fn subscribers_see_records_after_subscribing() {
        let log = InMemoryEventLog::new();
        log.publish(record("before")).await.unwrap();

        let mut sub = log.subscribe().await.unwrap();
        log.publish(record("after")).await.unwrap();

        assert_eq!(sub.next_record().await.unwrap().unwrap().key, "after");
        assert_eq!(log.published().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let log = InMemoryEventLog::new();
        log.fail_next(1);
        assert!(log.publish(record("a")).await.is_err());
        assert!(log.publish(record("a")).await.is_ok());
        assert_eq!(log.published().len(), 1);
    }
}
