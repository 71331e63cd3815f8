use actix_web::{http::header::CONTENT_TYPE, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

static WS_ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "chat_delivery_ws_active_connections",
        "WebSocket connections registered in this instance's hub",
    )
    .expect("failed to create chat_delivery_ws_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register chat_delivery_ws_active_connections");
    gauge
});

static WS_FRAMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_delivery_ws_frames_total",
            "Outbound frames offered to connection queues, by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create chat_delivery_ws_frames_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_delivery_ws_frames_total");
    counter
});

static INBOUND_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_delivery_inbound_rejected_total",
            "Inbound envelopes dropped at the socket boundary",
        ),
        &["reason"],
    )
    .expect("failed to create chat_delivery_inbound_rejected_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_delivery_inbound_rejected_total");
    counter
});

static EVENT_PUBLISH_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_delivery_event_publish_failures_total",
            "Message events that exhausted publish retries",
        ),
        &["event_type"],
    )
    .expect("failed to create chat_delivery_event_publish_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_delivery_event_publish_failures_total");
    counter
});

static RELAYED_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_delivery_relayed_events_total",
            "Cross-instance events received, by source and outcome",
        ),
        &["source", "outcome"],
    )
    .expect("failed to create chat_delivery_relayed_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_delivery_relayed_events_total");
    counter
});

static PUBSUB_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "chat_delivery_pubsub_failures_total",
        "Pub/sub publishes that failed or timed out",
    )
    .expect("failed to create chat_delivery_pubsub_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_delivery_pubsub_failures_total");
    counter
});

static DECRYPT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "chat_delivery_decrypt_failures_total",
        "Stored messages whose content could not be decrypted",
    )
    .expect("failed to create chat_delivery_decrypt_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_delivery_decrypt_failures_total");
    counter
});

pub fn connection_opened() {
    WS_ACTIVE_CONNECTIONS.inc();
}

pub fn connection_closed() {
    WS_ACTIVE_CONNECTIONS.dec();
}

/// `outcome` is one of `delivered`, `dropped`, `evicted`, `closed`.
pub fn record_frame(outcome: &str) {
    WS_FRAMES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_inbound_rejected(reason: &str) {
    INBOUND_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_publish_failure(event_type: &str) {
    EVENT_PUBLISH_FAILURES_TOTAL
        .with_label_values(&[event_type])
        .inc();
}

/// `source` is `log` or `pubsub`.
pub fn record_relayed(source: &str, outcome: &str) {
    RELAYED_EVENTS_TOTAL
        .with_label_values(&[source, outcome])
        .inc();
}

pub fn record_pubsub_failure() {
    PUBSUB_FAILURES_TOTAL.inc();
}

pub fn record_decrypt_failure() {
    DECRYPT_FAILURES_TOTAL.inc();
}

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .insert_header((CONTENT_TYPE, encoder.format_type().to_string()))
        .body(buffer)
}
