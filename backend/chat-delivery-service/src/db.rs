use crate::error::AppError;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::info;

const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Build a deadpool-postgres pool and verify it with `SELECT 1`.
pub async fn init_pool(database_url: &str, connect_timeout: Duration) -> Result<Pool, AppError> {
    let pg_config: PgConfig = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let max_size = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(max_size)
        .build()
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    let verify = async {
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok::<(), AppError>(())
    };
    match tokio::time::timeout(connect_timeout, verify).await {
        Ok(Ok(())) => {
            info!(max_size, "Database pool created and verified successfully");
            Ok(pool)
        }
        Ok(Err(e)) => Err(AppError::StartServer(format!("db verification: {e}"))),
        Err(_) => Err(AppError::StartServer(format!(
            "db verification timed out after {connect_timeout:?}"
        ))),
    }
}
