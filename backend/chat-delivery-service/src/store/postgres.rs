use super::{ConversationStore, MessageStore, RangeQuery, SetMutation};
use crate::error::{AppError, AppResult};
use crate::models::{Conversation, Message, MessageKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::{BTreeMap, BTreeSet};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, kind, reply_to, metadata, \
     created_at, edited_at, delivered, read_by, deleted_for, reactions";

fn message_from_row(row: &Row) -> AppResult<Message> {
    let kind: String = row.get("kind");
    let read_by: Vec<String> = row.get("read_by");
    let deleted_for: Vec<String> = row.get("deleted_for");
    let reactions: serde_json::Value = row.get("reactions");
    let reactions: BTreeMap<String, BTreeSet<String>> = serde_json::from_value(reactions)
        .map_err(|e| AppError::Database(format!("corrupt reactions column: {e}")))?;

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        content: row.get("content"),
        kind: kind
            .parse::<MessageKind>()
            .map_err(AppError::Database)?,
        reply_to: row.get("reply_to"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        edited_at: row.get("edited_at"),
        delivered: row.get("delivered"),
        read_by: read_by.into_iter().collect(),
        deleted_for: deleted_for.into_iter().collect(),
        reactions,
    })
}

fn conversation_from_row(row: &Row) -> Conversation {
    let members: Vec<String> = row.get("members");
    Conversation {
        id: row.get("id"),
        members: members.into_iter().collect(),
        is_group: row.get("is_group"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[derive(Clone)]
pub struct PostgresMessageStore {
    db: Pool,
}

impl PostgresMessageStore {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }

    /// Run a conditional UPDATE that returns `conversation_id` only when it
    /// changed the row. The membership test lives in the UPDATE's WHERE clause,
    /// so Postgres re-evaluates it against the latest row version once the row
    /// lock is held and concurrent identical adds change the set once.
    async fn guarded_update(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        message_id: &str,
    ) -> AppResult<Option<SetMutation>> {
        let client = self.db.get().await?;
        if let Some(row) = client.query_opt(sql, params).await? {
            return Ok(Some(SetMutation {
                conversation_id: row.get("conversation_id"),
                changed: true,
            }));
        }
        let row = client
            .query_opt(
                "SELECT conversation_id FROM chat_messages WHERE id = $1",
                &[&message_id],
            )
            .await?;
        Ok(row.map(|row| SetMutation {
            conversation_id: row.get("conversation_id"),
            changed: false,
        }))
    }
}

/// `$1` message id, `$2` member to add to the text[] `column`.
fn append_unique_sql(column: &str) -> String {
    format!(
        "UPDATE chat_messages SET {column} = array_append({column}, $2::text) \
         WHERE id = $1 AND NOT ($2::text = ANY({column})) \
         RETURNING conversation_id"
    )
}

/// `$1` message id, `$2` emoji, `$3` reacting user.
const ADD_REACTION_SQL: &str = r#"
    UPDATE chat_messages
    SET reactions = jsonb_set(
        reactions,
        ARRAY[$2::text],
        COALESCE(reactions -> $2::text, '[]'::jsonb) || to_jsonb($3::text),
        TRUE
    )
    WHERE id = $1 AND NOT COALESCE((reactions -> $2::text) ? $3::text, FALSE)
    RETURNING conversation_id
"#;

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn insert_if_absent(&self, message: Message) -> AppResult<(Message, bool)> {
        let client = self.db.get().await?;
        let reactions = serde_json::to_value(&message.reactions)
            .map_err(|e| AppError::Database(e.to_string()))?;
        let read_by: Vec<&String> = message.read_by.iter().collect();
        let deleted_for: Vec<&String> = message.deleted_for.iter().collect();

        let inserted = client
            .query_opt(
                r#"
                INSERT INTO chat_messages (
                    id, conversation_id, sender_id, content, kind, reply_to, metadata,
                    created_at, edited_at, delivered, read_by, deleted_for, reactions
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (id) DO NOTHING
                RETURNING id
                "#,
                &[
                    &message.id,
                    &message.conversation_id,
                    &message.sender_id,
                    &message.content,
                    &message.kind.as_str(),
                    &message.reply_to,
                    &message.metadata,
                    &message.created_at,
                    &message.edited_at,
                    &message.delivered,
                    &read_by,
                    &deleted_for,
                    &reactions,
                ],
            )
            .await?;

        if inserted.is_some() {
            return Ok((message, true));
        }

        let existing = self
            .find_by_id(&message.id)
            .await?
            .ok_or_else(|| {
                AppError::Database(format!("message {} vanished after conflict", message.id))
            })?;
        Ok((existing, false))
    }

    async fn find_by_id(&self, message_id: &str) -> AppResult<Option<Message>> {
        let client = self.db.get().await?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = $1");
        client
            .query_opt(sql.as_str(), &[&message_id])
            .await?
            .map(|row| message_from_row(&row))
            .transpose()
    }

    async fn find_range(
        &self,
        conversation_id: &str,
        query: &RangeQuery,
    ) -> AppResult<Vec<Message>> {
        let client = self.db.get().await?;
        let limit = query.limit as i64;
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM chat_messages
            WHERE conversation_id = $1
              AND ($2::timestamptz IS NULL OR created_at < $2)
              AND ($3::text IS NULL OR NOT ($3::text = ANY(deleted_for)))
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        );
        let rows = client
            .query(
                sql.as_str(),
                &[&conversation_id, &query.before, &query.viewer, &limit],
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn add_reader(&self, message_id: &str, user_id: &str) -> AppResult<Option<SetMutation>> {
        let sql = append_unique_sql("read_by");
        self.guarded_update(&sql, &[&message_id, &user_id], message_id)
            .await
    }

    async fn add_deleted_for(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> AppResult<Option<SetMutation>> {
        let sql = append_unique_sql("deleted_for");
        self.guarded_update(&sql, &[&message_id, &user_id], message_id)
            .await
    }

    async fn add_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> AppResult<Option<SetMutation>> {
        self.guarded_update(ADD_REACTION_SQL, &[&message_id, &emoji, &user_id], message_id)
            .await
    }

    async fn replace_content(
        &self,
        message_id: &str,
        content: Vec<u8>,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Option<String>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "UPDATE chat_messages SET content = $2, edited_at = $3 \
                 WHERE id = $1 RETURNING conversation_id",
                &[&message_id, &content, &edited_at],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn mark_delivered(&self, message_id: &str) -> AppResult<()> {
        let client = self.db.get().await?;
        client
            .execute(
                "UPDATE chat_messages SET delivered = TRUE WHERE id = $1 AND NOT delivered",
                &[&message_id],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, message_id: &str) -> AppResult<Option<String>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "DELETE FROM chat_messages WHERE id = $1 RETURNING conversation_id",
                &[&message_id],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }
}

#[derive(Clone)]
pub struct PostgresConversationStore {
    db: Pool,
}

impl PostgresConversationStore {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for PostgresConversationStore {
    async fn insert_if_absent(&self, conversation: Conversation) -> AppResult<Conversation> {
        let client = self.db.get().await?;
        let members: Vec<&String> = conversation.members.iter().collect();
        client
            .execute(
                r#"
                INSERT INTO chat_conversations (id, members, is_group, name, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
                &[
                    &conversation.id,
                    &members,
                    &conversation.is_group,
                    &conversation.name,
                    &conversation.created_at,
                    &conversation.updated_at,
                ],
            )
            .await?;
        drop(client);

        self.find_by_id(&conversation.id)
            .await?
            .ok_or_else(|| {
                AppError::Database(format!(
                    "conversation {} missing after insert",
                    conversation.id
                ))
            })
    }

    async fn find_by_id(&self, conversation_id: &str) -> AppResult<Option<Conversation>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT id, members, is_group, name, created_at, updated_at \
                 FROM chat_conversations WHERE id = $1",
                &[&conversation_id],
            )
            .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn update(&self, conversation: &Conversation) -> AppResult<bool> {
        let client = self.db.get().await?;
        let members: Vec<&String> = conversation.members.iter().collect();
        let updated = client
            .execute(
                "UPDATE chat_conversations SET members = $2, name = $3, updated_at = $4 \
                 WHERE id = $1",
                &[
                    &conversation.id,
                    &members,
                    &conversation.name,
                    &conversation.updated_at,
                ],
            )
            .await?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_test_sits_in_the_update() {
        let sql = append_unique_sql("read_by");
        assert!(sql.starts_with("UPDATE chat_messages SET read_by"));
        assert!(sql.contains("WHERE id = $1 AND NOT ($2::text = ANY(read_by))"));
        assert!(!sql.contains("WITH"));

        let reaction = ADD_REACTION_SQL.trim_start();
        assert!(reaction.starts_with("UPDATE chat_messages"));
        assert!(reaction.contains("AND NOT COALESCE((reactions -> $2::text) ? $3::text, FALSE)"));
        assert!(reaction.trim_end().ends_with("RETURNING conversation_id"));
    }
}
