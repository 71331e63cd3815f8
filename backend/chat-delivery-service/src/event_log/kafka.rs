use super::{EventLog, EventLogError, EventSubscription, LogRecord};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;
use tracing::{debug, info};

const EVENT_TYPE_HEADER: &str = "event_type";

/// Kafka-backed event log: one topic, keyed by conversation id.
#[derive(Clone)]
pub struct KafkaEventLog {
    producer: FutureProducer,
    brokers: String,
    topic: String,
    group_id: String,
    send_timeout: Duration,
}

impl KafkaEventLog {
    pub fn new(
        brokers: &str,
        topic: &str,
        group_id: &str,
        send_timeout: Duration,
    ) -> Result<Self, EventLogError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| EventLogError::Config(format!("Failed to create Kafka producer: {e}")))?;

        info!(
            brokers = %brokers,
            topic = %topic,
            group_id = %group_id,
            "Kafka event log initialized"
        );

        Ok(Self {
            producer,
            brokers: brokers.to_string(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            send_timeout,
        })
    }

    /// Fetch topic metadata; a failure here means the log is unreachable.
    pub async fn verify_topic(&self, timeout: Duration) -> Result<(), EventLogError> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let partitions = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(topic.as_str()), timeout)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .find(|t| t.name() == topic)
                        .map(|t| t.partitions().len())
                        .unwrap_or(0)
                })
        })
        .await
        .map_err(|e| EventLogError::Config(format!("metadata task failed: {e}")))?
        .map_err(|e| EventLogError::Config(format!("metadata fetch failed: {e}")))?;

        info!(topic = %self.topic, partitions, "Kafka topic reachable");
        Ok(())
    }
}

#[async_trait]
impl EventLog for KafkaEventLog {
    async fn publish(&self, record: LogRecord) -> Result<(), EventLogError> {
        let mut kafka_record = FutureRecord::to(&self.topic)
            .key(record.key.as_str())
            .payload(record.payload.as_slice());
        if let Some(event_type) = record.event_type.as_deref() {
            kafka_record = kafka_record.headers(OwnedHeaders::new().insert(Header {
                key: EVENT_TYPE_HEADER,
                value: Some(event_type),
            }));
        }

        match self.producer.send(kafka_record, self.send_timeout).await {
            Ok((partition, offset)) => {
                debug!(key = %record.key, partition, offset, "Event published to Kafka");
                Ok(())
            }
            Err((e, _)) => Err(EventLogError::Publish(e.to_string())),
        }
    }

    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>, EventLogError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| EventLogError::Config(format!("Failed to create Kafka consumer: {e}")))?;

        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| EventLogError::Config(format!("Failed to subscribe to topic: {e}")))?;

        info!(topic = %self.topic, group_id = %self.group_id, "Subscribed to message event topic");
        Ok(Box::new(KafkaSubscription { consumer }))
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
}

#[async_trait]
impl EventSubscription for KafkaSubscription {
    async fn next_record(&mut self) -> Result<Option<LogRecord>, EventLogError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| EventLogError::Consume(e.to_string()))?;

        let event_type = message.headers().and_then(|headers| {
            headers
                .iter()
                .find(|h| h.key == EVENT_TYPE_HEADER)
                .and_then(|h| h.value)
                .and_then(|v| std::str::from_utf8(v).ok())
                .map(str::to_string)
        });

        Ok(Some(LogRecord {
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            event_type,
        }))
    }
}
