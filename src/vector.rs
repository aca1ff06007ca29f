//! Vector index over SQLite.
//!
//! Embeddings are stored as little-endian f32 BLOBs and ranked by cosine
//! similarity in process. Every query carries a [`VectorScope`]: general
//! knowledge rows have no conversation tag, uploaded-document rows carry
//! the owning conversation's id, and the scope filter is the only
//! isolation boundary between them.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;
use crate::models::{VectorMatch, VectorMetadata, VectorRecord};

/// Rows upserted per SQL transaction.
const UPSERT_BATCH: usize = 100;

/// Which partition of the index a query runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorScope {
    /// Shared knowledge base: rows with no conversation tag.
    General,
    /// Documents uploaded into one conversation.
    Conversation(String),
}

/// Storage abstraction for embedding records.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by id.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Top-K cosine-similarity matches within the given scope, best first.
    async fn query(&self, vector: &[f32], top_k: usize, scope: &VectorScope)
        -> Result<Vec<VectorMatch>>;

    /// Delete records by id. Missing ids are not an error.
    async fn delete_many(&self, ids: &[String]) -> Result<()>;

    /// Delete every record tagged with the given conversation.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        for batch in records.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            for record in batch {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO vectors
                        (id, conversation_id, source, doc_type, chunk_index,
                         chunk_total, text, embedding, ingested_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.id)
                .bind(&record.metadata.conversation_id)
                .bind(&record.metadata.source)
                .bind(&record.metadata.doc_type)
                .bind(record.metadata.chunk_index)
                .bind(record.metadata.chunk_total)
                .bind(&record.metadata.text)
                .bind(vec_to_blob(&record.embedding))
                .bind(record.metadata.ingested_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        scope: &VectorScope,
    ) -> Result<Vec<VectorMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let rows = match scope {
            VectorScope::General => {
                sqlx::query(
                    r#"
                    SELECT id, conversation_id, source, doc_type, chunk_index,
                           chunk_total, text, embedding, ingested_at
                    FROM vectors
                    WHERE conversation_id IS NULL
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
            VectorScope::Conversation(id) => {
                sqlx::query(
                    r#"
                    SELECT id, conversation_id, source, doc_type, chunk_index,
                           chunk_total, text, embedding, ingested_at
                    FROM vectors
                    WHERE conversation_id = ?
                    "#,
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut scored: Vec<VectorMatch> = rows
            .into_iter()
            .map(|row| {
                let embedding = blob_to_vec(row.get::<Vec<u8>, _>("embedding").as_slice());
                VectorMatch {
                    id: row.get("id"),
                    score: cosine_similarity(vector, &embedding),
                    metadata: VectorMetadata {
                        conversation_id: row.get("conversation_id"),
                        source: row.get("source"),
                        doc_type: row.get("doc_type"),
                        chunk_index: row.get("chunk_index"),
                        chunk_total: row.get("chunk_total"),
                        text: row.get("text"),
                        ingested_at: row.get("ingested_at"),
                    },
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_many(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM vectors WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    fn record(id: &str, conversation: Option<&str>, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding,
            metadata: VectorMetadata {
                conversation_id: conversation.map(str::to_string),
                source: format!("{id}.txt"),
                doc_type: None,
                chunk_index: 0,
                chunk_total: 1,
                text: format!("text for {id}"),
                ingested_at: 0,
            },
        }
    }

    async fn index_with_fixtures() -> SqliteVectorIndex {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = SqliteVectorIndex::new(pool);
        index
            .upsert(&[
                record("general-1", None, vec![1.0, 0.0, 0.0]),
                record("general-2", None, vec![0.0, 1.0, 0.0]),
                record("conv-a-1", Some("conv-a"), vec![1.0, 0.0, 0.0]),
                record("conv-b-1", Some("conv-b"), vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn general_scope_excludes_tagged_rows() {
        let index = index_with_fixtures().await;
        let matches = index
            .query(&[1.0, 0.0, 0.0], 10, &VectorScope::General)
            .await
            .unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["general-1", "general-2"]);
    }

    #[tokio::test]
    async fn conversation_scope_sees_only_its_own_rows() {
        let index = index_with_fixtures().await;
        let matches = index
            .query(
                &[1.0, 0.0, 0.0],
                10,
                &VectorScope::Conversation("conv-a".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "conv-a-1");
    }

    #[tokio::test]
    async fn results_ranked_by_similarity() {
        let index = index_with_fixtures().await;
        let matches = index
            .query(&[0.1, 1.0, 0.0], 2, &VectorScope::General)
            .await
            .unwrap();
        assert_eq!(matches[0].id, "general-2");
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = index_with_fixtures().await;
        index
            .upsert(&[record("general-1", None, vec![0.0, 0.0, 1.0])])
            .await
            .unwrap();
        let matches = index
            .query(&[0.0, 0.0, 1.0], 1, &VectorScope::General)
            .await
            .unwrap();
        assert_eq!(matches[0].id, "general-1");
        assert!((matches[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn delete_conversation_removes_only_that_tag() {
        let index = index_with_fixtures().await;
        index.delete_conversation("conv-a").await.unwrap();

        let a = index
            .query(
                &[1.0, 0.0, 0.0],
                10,
                &VectorScope::Conversation("conv-a".to_string()),
            )
            .await
            .unwrap();
        assert!(a.is_empty());

        let b = index
            .query(
                &[1.0, 0.0, 0.0],
                10,
                &VectorScope::Conversation("conv-b".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(b.len(), 1);

        let general = index
            .query(&[1.0, 0.0, 0.0], 10, &VectorScope::General)
            .await
            .unwrap();
        assert_eq!(general.len(), 2);
    }

    #[tokio::test]
    async fn delete_many_is_tolerant_of_missing_ids() {
        let index = index_with_fixtures().await;
        index
            .delete_many(&["general-1".to_string(), "no-such-id".to_string()])
            .await
            .unwrap();
        let general = index
            .query(&[1.0, 0.0, 0.0], 10, &VectorScope::General)
            .await
            .unwrap();
        assert_eq!(general.len(), 1);
    }
}
