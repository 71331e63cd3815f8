use crate::error::AppError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Capacity of each connection's outbound queue
    pub outbound_queue_capacity: usize,
    pub ping_interval: Duration,
    /// Deadline for a single socket write
    pub write_timeout: Duration,
    /// A client silent for this long is torn down
    pub client_timeout: Duration,
    /// Consecutive dropped frames before a connection is evicted (0 disables eviction)
    pub max_consecutive_drops: u32,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            ping_interval: Duration::from_secs(25),
            write_timeout: Duration::from_secs(10),
            client_timeout: Duration::from_secs(60),
            max_consecutive_drops: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub message_events_topic: String,
    pub consumer_group_prefix: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".into(),
            message_events_topic: "chat.message.events".into(),
            consumer_group_prefix: "chat-delivery".into(),
        }
    }
}

impl KafkaConfig {
    /// Every instance consumes the full topic, so each gets its own group.
    pub fn consumer_group(&self, instance_id: &str) -> String {
        format!("{}-{}", self.consumer_group_prefix, instance_id)
    }
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub ttl: Duration,
    /// Upper bound on any single presence/pub-sub call
    pub call_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
            call_timeout: Duration::from_millis(1500),
        }
    }
}

impl PresenceConfig {
    pub fn refresh_interval(&self) -> Duration {
        (self.ttl / 2).max(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub recent_size: usize,
    pub recent_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            recent_size: 50,
            recent_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub publish_max_retries: u32,
    pub publish_initial_backoff: Duration,
    pub publish_timeout: Duration,
    pub store_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            publish_max_retries: 3,
            publish_initial_backoff: Duration::from_millis(100),
            publish_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_millis(5000),
        }
    }
}

impl PipelineConfig {
    pub fn publish_retry(&self) -> resilience::RetryConfig {
        resilience::RetryConfig {
            max_retries: self.publish_max_retries,
            initial_backoff: self.publish_initial_backoff,
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    /// Identifies this process in relayed events and pub/sub frames
    pub instance_id: String,
    pub encryption_master_key: [u8; 32],
    pub jwt_public_key_pem: String,
    pub websocket: WebSocketConfig,
    pub kafka: KafkaConfig,
    pub presence: PresenceConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{name} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn decode_master_key(encoded: &str) -> Result<[u8; 32], AppError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AppError::Config(format!("ENCRYPTION_MASTER_KEY is not base64: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        AppError::Config(format!(
            "ENCRYPTION_MASTER_KEY must decode to 32 bytes, got {}",
            b.len()
        ))
    })
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = string_var("REDIS_URL", "redis://127.0.0.1:6379");
        let port = parse_var("PORT", 8085u16)?;
        let instance_id = string_var("INSTANCE_ID", &uuid::Uuid::new_v4().to_string());

        let encryption_master_key = decode_master_key(
            &env::var("ENCRYPTION_MASTER_KEY")
                .map_err(|_| AppError::Config("ENCRYPTION_MASTER_KEY missing".into()))?,
        )?;

        let jwt_public_key_pem = match env::var("JWT_PUBLIC_KEY_PEM") {
            Ok(pem) if !pem.trim().is_empty() => pem,
            _ => {
                let path = env::var("JWT_PUBLIC_KEY_FILE").map_err(|_| {
                    AppError::Config("JWT_PUBLIC_KEY_PEM or JWT_PUBLIC_KEY_FILE must be set".into())
                })?;
                std::fs::read_to_string(&path)
                    .map_err(|e| AppError::Config(format!("reading {path}: {e}")))?
            }
        };

        let ws_defaults = WebSocketConfig::default();
        let websocket = WebSocketConfig {
            outbound_queue_capacity: parse_var(
                "WS_OUTBOUND_QUEUE_CAPACITY",
                ws_defaults.outbound_queue_capacity,
            )?,
            ping_interval: Duration::from_secs(parse_var("WS_PING_INTERVAL_SECS", 25u64)?),
            write_timeout: Duration::from_secs(parse_var("WS_WRITE_TIMEOUT_SECS", 10u64)?),
            client_timeout: Duration::from_secs(parse_var("WS_CLIENT_TIMEOUT_SECS", 60u64)?),
            max_consecutive_drops: parse_var(
                "WS_MAX_CONSECUTIVE_DROPS",
                ws_defaults.max_consecutive_drops,
            )?,
        };
        if websocket.outbound_queue_capacity == 0 {
            return Err(AppError::Config(
                "WS_OUTBOUND_QUEUE_CAPACITY must be greater than zero".into(),
            ));
        }

        let kafka_defaults = KafkaConfig::default();
        let kafka = KafkaConfig {
            brokers: string_var("KAFKA_BROKERS", &kafka_defaults.brokers),
            message_events_topic: string_var(
                "KAFKA_MESSAGE_EVENTS_TOPIC",
                &kafka_defaults.message_events_topic,
            ),
            consumer_group_prefix: string_var(
                "KAFKA_CONSUMER_GROUP_PREFIX",
                &kafka_defaults.consumer_group_prefix,
            ),
        };

        let presence = PresenceConfig {
            ttl: Duration::from_secs(parse_var("PRESENCE_TTL_SECS", 120u64)?),
            call_timeout: Duration::from_millis(parse_var("PRESENCE_TIMEOUT_MS", 1500u64)?),
        };

        let cache = CacheConfig {
            recent_size: parse_var("RECENT_CACHE_SIZE", 50usize)?,
            recent_ttl: Duration::from_secs(parse_var("RECENT_CACHE_TTL_SECS", 3600u64)?),
        };

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            publish_max_retries: parse_var(
                "PUBLISH_MAX_RETRIES",
                pipeline_defaults.publish_max_retries,
            )?,
            publish_initial_backoff: Duration::from_millis(parse_var(
                "PUBLISH_INITIAL_BACKOFF_MS",
                100u64,
            )?),
            publish_timeout: pipeline_defaults.publish_timeout,
            store_timeout: Duration::from_millis(parse_var("STORE_TIMEOUT_MS", 5000u64)?),
        };

        Ok(Self {
            database_url,
            redis_url,
            port,
            instance_id,
            encryption_master_key,
            jwt_public_key_pem,
            websocket,
            kafka,
            presence,
            cache,
            pipeline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_must_be_32_bytes() {
        let ok = STANDARD.encode([1u8; 32]);
        assert_eq!(decode_master_key(&ok).unwrap(), [1u8; 32]);

        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(decode_master_key(&short), Err(AppError::Config(_))));
        assert!(matches!(decode_master_key("not base64!"), Err(AppError::Config(_))));
    }

    #[test]
    fn consumer_group_is_per_instance() {
        let kafka = KafkaConfig::default();
        assert_eq!(kafka.consumer_group("node-a"), "chat-delivery-node-a");
        assert_ne!(kafka.consumer_group("node-a"), kafka.consumer_group("node-b"));
    }

    #[test]
    fn presence_refresh_runs_at_half_ttl() {
        let presence = PresenceConfig {
            ttl: Duration::from_secs(120),
            ..Default::default()
        };
        assert_eq!(presence.refresh_interval(), Duration::from_secs(60));
    }
}
