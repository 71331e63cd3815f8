use actix_web::{web, App, HttpServer};
use anyhow::Context;
use chat_delivery_service::{
    auth::JwtVerifier,
    config::Config,
    db,
    event_log::KafkaEventLog,
    logging, migrations,
    presence::RedisPresenceStore,
    redis_client::RedisClient,
    routes,
    services::RedisRecentCache,
    state::{AppState, Backends},
    store::{PostgresConversationStore, PostgresMessageStore},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = Config::from_env().context("loading configuration")?;

    // The durable store and log must be reachable before we accept connections.
    let db = db::init_pool(&cfg.database_url, STARTUP_CHECK_TIMEOUT)
        .await
        .context("connecting to postgres")?;
    migrations::run_all(&db)
        .await
        .context("running migrations")?;

    let event_log = KafkaEventLog::new(
        &cfg.kafka.brokers,
        &cfg.kafka.message_events_topic,
        &cfg.kafka.consumer_group(&cfg.instance_id),
        cfg.pipeline.publish_timeout,
    )
    .context("creating kafka client")?;
    event_log
        .verify_topic(STARTUP_CHECK_TIMEOUT)
        .await
        .context("verifying kafka topic")?;

    // Redis connects lazily; an outage only degrades presence, pub/sub and caching.
    let redis = RedisClient::open(&cfg.redis_url).context("parsing REDIS_URL")?;
    let verifier = JwtVerifier::from_rsa_pem(&cfg.jwt_public_key_pem)
        .context("loading JWT public key")?;

    let backends = Backends {
        messages: Arc::new(PostgresMessageStore::new(db.clone())),
        conversations: Arc::new(PostgresConversationStore::new(db.clone())),
        presence: Arc::new(RedisPresenceStore::new(redis.clone(), cfg.presence.call_timeout)),
        cache: Arc::new(RedisRecentCache::new(
            redis,
            cfg.cache.recent_size,
            cfg.cache.recent_ttl,
            cfg.presence.call_timeout,
        )),
        event_log: Arc::new(event_log),
        verifier: Arc::new(verifier),
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    let instance_id = cfg.instance_id.clone();
    let (state, relays) = AppState::build(cfg, backends);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event_relay = tokio::spawn(relays.events.run(shutdown_rx.clone()));
    let pubsub_subscriber = tokio::spawn(relays.pubsub.clone().run_subscriber(shutdown_rx));
    let pubsub_publisher = tokio::spawn(relays.pubsub.run_publisher(relays.pubsub_requests));

    tracing::info!(%bind_addr, %instance_id, "starting chat-delivery-service");

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .configure(routes::configure)
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("binding {bind_addr}"))?
    .run();

    let server_handle = server.handle();
    let hub = state.hub.clone();
    let drain_timeout = state.config.websocket.write_timeout;
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received, draining connections");
        hub.shutdown().await;
        let deadline = Instant::now() + drain_timeout;
        while hub.connection_count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let _ = shutdown_tx.send(true);
        server_handle.stop(true).await;
    });

    server.await.context("running HTTP server")?;

    let _ = tokio::join!(event_relay, pubsub_subscriber);
    // The relays hold hub clones, so the publisher's queue never closes on its own.
    pubsub_publisher.abort();
    tracing::info!("chat-delivery-service stopped");
    Ok(())
}
