//! Conversation and message persistence.
//!
//! Every read or delete that names a conversation checks ownership first.
//! A missing conversation and one owned by someone else produce the same
//! [`ChatError::Authorization`], so callers cannot test for existence.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::models::{Conversation, Message, Role};

/// Max chars of the first message used as the conversation title.
const TITLE_MAX_CHARS: usize = 60;

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a conversation owned by `user_id`, titling it from the
    /// opening message.
    pub async fn create_conversation(
        &self,
        user_id: &str,
        first_message: &str,
    ) -> Result<Conversation> {
        let now = chrono::Utc::now().timestamp();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: derive_title(first_message),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    /// Fetch a conversation the user owns. Missing and foreign-owned
    /// conversations are indistinguishable to the caller.
    pub async fn get_owned(&self, conversation_id: &str, user_id: &str) -> Result<Conversation> {
        let found: Option<Conversation> =
            sqlx::query_as("SELECT * FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;

        match found {
            Some(c) if c.user_id == user_id => Ok(c),
            _ => Err(ChatError::Authorization),
        }
    }

    /// All conversations for a user, most recently active first.
    pub async fn get_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let rows = sqlx::query_as(
            "SELECT * FROM conversations WHERE user_id = ? ORDER BY updated_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Messages of an owned conversation in chronological order.
    pub async fn get_conversation_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Vec<Message>> {
        self.get_owned(conversation_id, user_id).await?;
        let rows = sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at, id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Append a message and bump the conversation's activity timestamp
    /// in the same transaction, so recency ordering tracks every message
    /// including ones persisted on a failed turn.
    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        metadata_json: Option<&str>,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: role.as_str().to_string(),
            content: content.to_string(),
            metadata_json: metadata_json.map(str::to_string),
            created_at: chrono::Utc::now().timestamp(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, metadata_json, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&message.metadata_json)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(message.created_at)
            .bind(&message.conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(message)
    }

    /// Delete an owned conversation and its messages. Vector cleanup is
    /// the caller's responsibility and must happen before this commits.
    pub async fn delete_conversation(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.get_owned(conversation_id, user_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// First line of the opening message, truncated on a char boundary.
fn derive_title(first_message: &str) -> String {
    let line = first_message.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return "New conversation".to_string();
    }
    if line.chars().count() <= TITLE_MAX_CHARS {
        line.to_string()
    } else {
        let truncated: String = line.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}…", truncated.trim_end())
    }
}
