//! Consumes the durable log and delivers lifecycle events published by other
//! instances to local connections.

use super::encryption::EncryptionService;
use super::RelayOutcome;
use crate::event_log::{EventLog, LogRecord};
use crate::metrics;
use crate::websocket::events::audience_for;
use crate::websocket::{ConnectionHub, OutboundEvent};
use event_schema::{is_compatible, MessageEventEnvelope, SCHEMA_VERSION};
use resilience::{Backoff, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SOURCE: &str = "event_log";

pub struct EventRelay {
    log: Arc<dyn EventLog>,
    hub: ConnectionHub,
    encryption: EncryptionService,
    instance_id: String,
}

impl EventRelay {
    pub fn new(
        log: Arc<dyn EventLog>,
        hub: ConnectionHub,
        encryption: EncryptionService,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            log,
            hub,
            encryption,
            instance_id: instance_id.into(),
        }
    }

    fn backoff() -> Backoff {
        Backoff::new(&RetryConfig {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            ..RetryConfig::default()
        })
    }

    /// Run until `shutdown` flips or its sender is dropped. Read failures are
    /// retried with backoff; records are never held back for slow sockets.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Self::backoff();
        'outer: loop {
            let mut subscription = match self.log.subscribe().await {
                Ok(subscription) => {
                    info!(instance_id = %self.instance_id, "Event relay subscribed");
                    subscription
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Event log subscribe failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    next = subscription.next_record() => match next {
                        Ok(Some(record)) => {
                            backoff.reset();
                            self.handle_record(&record).await;
                        }
                        Ok(None) => {
                            warn!("Event log subscription ended, resubscribing");
                            break;
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            warn!(
                                error = %e,
                                retry_in_ms = delay.as_millis() as u64,
                                "Event log read failed"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.changed() => break 'outer,
                            }
                        }
                    }
                }
            }
        }
        info!("Event relay stopped");
    }

    pub async fn handle_record(&self, record: &LogRecord) -> RelayOutcome {
        let envelope: MessageEventEnvelope = match serde_json::from_slice(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::record_relayed(SOURCE, "malformed");
                warn!(
                    key = %record.key,
                    event_type = ?record.event_type,
                    error = %e,
                    "Skipping malformed event"
                );
                return RelayOutcome::Malformed;
            }
        };

        if !is_compatible(SCHEMA_VERSION, envelope.schema_version) {
            metrics::record_relayed(SOURCE, "incompatible");
            warn!(
                event_id = %envelope.event_id,
                schema_version = envelope.schema_version,
                "Skipping event with incompatible schema version"
            );
            return RelayOutcome::Incompatible;
        }

        if envelope.source == self.instance_id {
            metrics::record_relayed(SOURCE, "own_origin");
            return RelayOutcome::OwnOrigin;
        }

        let frame = match OutboundEvent::from_message_event(&envelope.data, &self.encryption)
            .to_frame()
        {
            Ok(frame) => frame,
            Err(_) => {
                metrics::record_relayed(SOURCE, "malformed");
                return RelayOutcome::Malformed;
            }
        };
        let report = self.hub.deliver(&audience_for(&envelope.data), frame).await;
        metrics::record_relayed(SOURCE, "delivered");
        debug!(
            event_id = %envelope.event_id,
            event_type = envelope.data.event_type(),
            source = %envelope.source,
            delivered = report.delivered,
            "Relayed event"
        );
        RelayOutcome::Delivered(report)
    }
}
