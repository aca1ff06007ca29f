//! Core data models used throughout the chat service.
//!
//! These types represent the conversations, messages, and vector records
//! that flow through the ingestion, retrieval, and chat pipelines.

use serde::{Deserialize, Serialize};

/// A conversation owned by exactly one user.
///
/// `updated_at` is bumped on every new message and drives list ordering
/// (most-recently-active first).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A single message in a conversation. Immutable once created; ordered
/// within its conversation by `created_at` ascending.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub metadata_json: Option<String>,
    pub created_at: i64,
}

/// Metadata attached to every vector record.
///
/// `conversation_id = None` marks shared general knowledge; `Some(id)`
/// restricts the record to retrieval queries scoped to that conversation.
/// The tag is the only isolation boundary between users' uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub conversation_id: Option<String>,
    pub source: String,
    pub doc_type: Option<String>,
    pub chunk_index: i64,
    pub chunk_total: i64,
    pub text: String,
    pub ingested_at: i64,
}

/// A vector record ready for upsert into the index.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// A similarity-search match returned by the vector index.
#[derive(Debug, Clone, Serialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(flatten)]
    pub metadata: VectorMetadata,
}
