use deadpool_postgres::Pool;

// Embed SQL migrations at compile time for deterministic startup
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_create_chat_messages",
        include_str!("../migrations/0001_create_chat_messages.sql"),
    ),
    (
        "0002_create_chat_conversations",
        include_str!("../migrations/0002_create_chat_conversations.sql"),
    ),
];

/// Apply every migration in order. Statements are idempotent (`IF NOT EXISTS`),
/// so a failure here means the database is unusable and startup must stop.
pub async fn run_all(db: &Pool) -> Result<(), crate::error::AppError> {
    let client = db.get().await?;
    for (label, sql) in MIGRATIONS {
        client.batch_execute(sql).await.map_err(|e| {
            tracing::error!(migration = %label, error = %e, "migration failed");
            crate::error::AppError::StartServer(format!("migration {label}: {e}"))
        })?;
        tracing::info!(migration = %label, "chat-delivery-service migration applied");
    }
    Ok(())
}
